//! Connection proxy
//!
//! Relays one accepted local connection to the remote target over a
//! direct-tcpip channel. The two directions run concurrently and the proxy
//! waits for both: whichever direction finishes first signals the other and
//! shuts down the counterpart write half, so neither side can stay blocked
//! on a dead peer.
//!
//! Termination is classified with a typed [`ConnectionEnd`] set at the point
//! the local socket's EOF or error is observed, never by matching error
//! message text.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use crate::config::HostPort;
use crate::error::TunnelError;
use crate::transport::SessionController;

/// Bound on local→remote writes so a stalled remote cannot park the relay
/// indefinitely. The remote→local direction has no timeout.
pub const LOCAL_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

const RELAY_BUF_SIZE: usize = 32 * 1024;

/// How one proxied connection ended.
#[derive(Debug)]
pub enum ConnectionEnd {
    /// The local client closed its side. Normal, silent termination.
    LocalClosed,
    /// The remote target finished the stream. Normal termination.
    RemoteClosed,
    /// Transport failure while relaying; surfaces to the supervisor.
    Failed(TunnelError),
}

impl ConnectionEnd {
    pub fn is_abnormal(&self) -> bool {
        matches!(self, ConnectionEnd::Failed(_))
    }
}

/// Why one relay direction stopped.
#[derive(Debug)]
enum DirectionEnd {
    /// Clean EOF from the side being read
    SourceEof,
    /// Read error on the side being read
    SourceErr(std::io::Error),
    /// Write error on the side being written
    SinkErr(std::io::Error),
    /// The bounded write timed out
    SinkTimeout,
    /// Stopped because the other direction finished first
    PeerFinished,
}

/// Proxy one local connection through the session to `target`.
pub async fn proxy_connection(
    id: u64,
    local: TcpStream,
    session: &SessionController,
    target: &HostPort,
) -> ConnectionEnd {
    let (originator_host, originator_port) = match local.peer_addr() {
        Ok(addr) => (addr.ip().to_string(), addr.port() as u32),
        Err(_) => ("127.0.0.1".to_string(), 0),
    };

    let channel = match session
        .open_direct_tcpip(
            &target.host,
            target.port as u32,
            &originator_host,
            originator_port,
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => return ConnectionEnd::Failed(e),
    };

    debug!("Opened channel to {} for connection {}", target, id);
    relay(id, local, channel.into_stream()).await
}

/// Relay bytes in both directions until the connection is over.
///
/// Generic over the remote stream so the relay can be exercised against an
/// in-memory duplex in tests.
pub(crate) async fn relay<S>(id: u64, local: TcpStream, remote: S) -> ConnectionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = local.into_split();
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let (up_done_tx, up_done_rx) = watch::channel(false);
    let (down_done_tx, down_done_rx) = watch::channel(false);

    // local → remote, with the bounded write
    let upstream = async {
        let mut peer_done = down_done_rx;
        let mut buf = vec![0u8; RELAY_BUF_SIZE];
        let end = loop {
            let n = tokio::select! {
                read = local_read.read(&mut buf) => match read {
                    Ok(0) => break DirectionEnd::SourceEof,
                    Ok(n) => n,
                    Err(e) => break DirectionEnd::SourceErr(e),
                },
                _ = peer_done.changed() => break DirectionEnd::PeerFinished,
            };
            match tokio::time::timeout(LOCAL_WRITE_TIMEOUT, remote_write.write_all(&buf[..n])).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => break DirectionEnd::SinkErr(e),
                Err(_) => break DirectionEnd::SinkTimeout,
            }
        };
        let _ = remote_write.shutdown().await;
        let _ = up_done_tx.send(true);
        end
    };

    // remote → local, no timeout
    let downstream = async {
        let mut peer_done = up_done_rx;
        let mut buf = vec![0u8; RELAY_BUF_SIZE];
        let end = loop {
            let n = tokio::select! {
                read = remote_read.read(&mut buf) => match read {
                    Ok(0) => break DirectionEnd::SourceEof,
                    Ok(n) => n,
                    Err(e) => break DirectionEnd::SourceErr(e),
                },
                _ = peer_done.changed() => break DirectionEnd::PeerFinished,
            };
            if let Err(e) = local_write.write_all(&buf[..n]).await {
                break DirectionEnd::SinkErr(e);
            }
        };
        let _ = local_write.shutdown().await;
        let _ = down_done_tx.send(true);
        end
    };

    let (up_end, down_end) = tokio::join!(upstream, downstream);
    debug!(
        "Relay for connection {} ended: up={:?} down={:?}",
        id, up_end, down_end
    );
    classify(up_end, down_end)
}

/// Combine the two per-direction endings into the connection outcome.
///
/// Remote-side failures dominate; they are what reconnection exists for.
/// Everything the local client did to its own socket is a normal close.
fn classify(up: DirectionEnd, down: DirectionEnd) -> ConnectionEnd {
    match &up {
        DirectionEnd::SinkTimeout => {
            return ConnectionEnd::Failed(TunnelError::ChannelError(format!(
                "write to remote timed out after {}s",
                LOCAL_WRITE_TIMEOUT.as_secs()
            )));
        }
        DirectionEnd::SinkErr(e) => {
            return ConnectionEnd::Failed(TunnelError::ChannelError(format!(
                "write to remote failed: {}",
                e
            )));
        }
        _ => {}
    }
    if let DirectionEnd::SourceErr(e) = &down {
        return ConnectionEnd::Failed(TunnelError::ChannelError(format!(
            "read from remote failed: {}",
            e
        )));
    }

    match (&up, &down) {
        // The local socket reached EOF, errored on read, or refused a write:
        // all mean the local client is gone.
        (DirectionEnd::SourceEof | DirectionEnd::SourceErr(_), _)
        | (_, DirectionEnd::SinkErr(_)) => ConnectionEnd::LocalClosed,
        _ => ConnectionEnd::RemoteClosed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use crate::transport::SessionController;

    async fn local_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn echo_then_local_close_is_normal() {
        let (mut client, local) = local_pair().await;
        let (remote, far) = tokio::io::duplex(4096);

        // the "database": echo until EOF
        let echo = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(far);
            let mut buf = vec![0u8; 1024];
            loop {
                let n = read.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                write.write_all(&buf[..n]).await.unwrap();
            }
        });

        let client_side = tokio::spawn(async move {
            client.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            client.shutdown().await.unwrap();
            // the proxy closes our read side once both directions are done
            let n = client.read(&mut [0u8; 8]).await.unwrap();
            assert_eq!(n, 0);
        });

        let end = relay(1, local, remote).await;
        assert!(!end.is_abnormal(), "got {:?}", end);
        assert!(matches!(end, ConnectionEnd::LocalClosed));

        client_side.await.unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn remote_eof_is_normal() {
        let (client, local) = local_pair().await;
        let (remote, far) = tokio::io::duplex(4096);

        // remote closes immediately without reading or writing
        drop(far);

        let end = relay(2, local, remote).await;
        assert!(matches!(end, ConnectionEnd::RemoteClosed), "got {:?}", end);
        drop(client);
    }

    #[tokio::test]
    async fn stalled_remote_trips_the_write_timeout() {
        let (mut client, local) = local_pair().await;
        // Tiny pipe and nobody draining it: the relay's write must stall.
        let (remote, far) = tokio::io::duplex(16);

        let client_side = tokio::spawn(async move {
            let payload = vec![0xA5u8; 1024];
            let _ = client.write_all(&payload).await;
            // keep the socket open while the relay is stuck
            let mut buf = [0u8; 16];
            let _ = client.read(&mut buf).await;
        });

        let end = relay(3, local, remote).await;
        match end {
            ConnectionEnd::Failed(TunnelError::ChannelError(msg)) => {
                assert!(msg.contains("timed out"), "unexpected message: {}", msg);
            }
            other => panic!("expected write timeout failure, got {:?}", other),
        }

        drop(far);
        client_side.await.unwrap();
    }

    #[tokio::test]
    async fn dead_session_fails_channel_open() {
        let (client, local) = local_pair().await;

        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        drop(cmd_rx);
        let session = SessionController::new(cmd_tx);

        let target = HostPort::new("db.internal", 5432);
        let end = proxy_connection(4, local, &session, &target).await;
        assert!(matches!(
            end,
            ConnectionEnd::Failed(TunnelError::Disconnected)
        ));
        drop(client);
    }

    #[test]
    fn classification_table() {
        // local EOF while remote still open
        assert!(matches!(
            classify(DirectionEnd::SourceEof, DirectionEnd::PeerFinished),
            ConnectionEnd::LocalClosed
        ));
        // local reset observed as a read error
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(matches!(
            classify(DirectionEnd::SourceErr(reset), DirectionEnd::SourceEof),
            ConnectionEnd::LocalClosed
        ));
        // local client refused the write
        let pipe = io::Error::from(io::ErrorKind::BrokenPipe);
        assert!(matches!(
            classify(DirectionEnd::PeerFinished, DirectionEnd::SinkErr(pipe)),
            ConnectionEnd::LocalClosed
        ));
        // remote drained cleanly
        assert!(matches!(
            classify(DirectionEnd::PeerFinished, DirectionEnd::SourceEof),
            ConnectionEnd::RemoteClosed
        ));
        // remote read failure is abnormal even if the local side also closed
        let err = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert!(matches!(
            classify(DirectionEnd::SourceEof, DirectionEnd::SourceErr(err)),
            ConnectionEnd::Failed(_)
        ));
        // stalled remote write
        assert!(matches!(
            classify(DirectionEnd::SinkTimeout, DirectionEnd::PeerFinished),
            ConnectionEnd::Failed(_)
        ));
    }
}
