//! Tunnel assembly
//!
//! Wires the listener, per-connection proxies and the reconnect supervisor
//! together:
//!
//! ```text
//!   accept loop ──▶ connection driver ──▶ proxy ⇄ session (supervisor-owned)
//!        │                │ Decide: normal end / reconnect / fatal
//!        └────────────────┴──▶ tunnel-wide error channel ──▶ Tunnel::run
//! ```
//!
//! One task per role: the accept loop, one driver per connection (the two
//! relay directions joined inside it), the ID generator, and the session
//! owner task behind the supervisor.

mod ids;
mod listener;
mod proxy;
mod supervisor;

pub use ids::ConnectionIds;
pub use listener::bind_with_fallback;
pub use proxy::{proxy_connection, ConnectionEnd, LOCAL_WRITE_TIMEOUT};
pub use supervisor::SessionSupervisor;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::auth::{resolve_credentials, PasswordPrompt};
use crate::config::{TransportConfig, TunnelConfig};
use crate::error::TunnelError;
use crate::transport::{BoundConnector, Connector};

/// One local-port-to-remote-target tunnel.
pub struct Tunnel {
    config: TunnelConfig,
    transport: TransportConfig,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            transport: TransportConfig::default(),
        }
    }

    /// Override the transport trust settings.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Resolve credentials, build the tunnel, and serve it.
    ///
    /// On success this never returns: the accept loop runs until the process
    /// is interrupted. The `Err` carries the first fatal error: resolution
    /// or initial authentication failures, a dead listener, or an abnormal
    /// session loss with reconnection disabled.
    pub async fn run(self, prompt: &PasswordPrompt) -> Result<(), TunnelError> {
        let credentials = resolve_credentials(&self.config.identity, prompt).await?;

        eprintln!("Building tunnel to {}", self.config.target);

        let factory = Arc::new(BoundConnector::new(
            Connector::new(self.transport.clone()),
            self.config.bastion.clone(),
            credentials,
        ));
        let supervisor = Arc::new(SessionSupervisor::new(factory, self.config.reconnect));
        supervisor.connect_initial().await?;

        serve(Arc::new(self.config), supervisor).await
    }
}

/// Bind the listener and serve connections until a fatal error.
async fn serve(
    config: Arc<TunnelConfig>,
    supervisor: Arc<SessionSupervisor>,
) -> Result<(), TunnelError> {
    let (listener, local_addr) = bind_with_fallback(&config.bind_addr, config.port).await?;

    // The one machine-parseable output: external tooling reads the effective
    // address from stdout, everything else goes to stderr.
    println!("{}", local_addr);

    let (err_tx, mut err_rx) = mpsc::channel::<TunnelError>(1);
    let ids = Arc::new(ConnectionIds::spawn());

    let accept = tokio::spawn(accept_loop(listener, ids, supervisor, config, err_tx));

    let fatal = err_rx.recv().await.unwrap_or(TunnelError::Disconnected);
    error!("Tunnel aborted: {}", fatal);
    accept.abort();
    Err(fatal)
}

/// Accept local connections forever, one driver task each.
async fn accept_loop(
    listener: TcpListener,
    ids: Arc<ConnectionIds>,
    supervisor: Arc<SessionSupervisor>,
    config: Arc<TunnelConfig>,
    err_tx: mpsc::Sender<TunnelError>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                let Some(id) = ids.next().await else {
                    break;
                };
                debug!("Accepted {} as connection {}", peer, id);
                eprintln!("Connect to {} [{}]", config.target, id);

                tokio::spawn(drive_connection(
                    id,
                    stream,
                    supervisor.clone(),
                    config.clone(),
                    err_tx.clone(),
                ));
            }
            Err(e) => {
                warn!("Accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Per-connection state machine: Connecting → Proxying → Decide.
async fn drive_connection(
    id: u64,
    local: TcpStream,
    supervisor: Arc<SessionSupervisor>,
    config: Arc<TunnelConfig>,
    err_tx: mpsc::Sender<TunnelError>,
) {
    // Connecting: borrow the current session, or wait out a reconnection
    let session = match supervisor.acquire().await {
        Ok(session) => session,
        Err(e) => {
            let _ = err_tx.send(e).await;
            return;
        }
    };

    // Proxying
    let end = proxy_connection(id, local, &session, &config.target).await;

    // Decide
    match end {
        ConnectionEnd::LocalClosed | ConnectionEnd::RemoteClosed => {
            eprintln!("End of connection [{}]", id);
        }
        ConnectionEnd::Failed(e) => {
            warn!("Connection {} lost its session: {}", id, e);
            supervisor.invalidate(&session).await;
            if config.reconnect {
                // This local socket is already gone; restore the transport so
                // the connections that follow land on a working session.
                if let Err(e) = supervisor.acquire().await {
                    let _ = err_tx.send(e).await;
                }
            } else {
                let _ = err_tx.send(e).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc as tokio_mpsc;
    use tokio::time::timeout;

    use crate::auth::Identity;
    use crate::config::HostPort;
    use crate::transport::{SessionCommand, SessionController, SessionFactory};

    fn test_config(reconnect: bool) -> TunnelConfig {
        let mut config = TunnelConfig::new(
            HostPort::new("db.internal", 5432),
            HostPort::new("bastion.test", 22),
            Identity::Agent,
        );
        config.port = 0; // ephemeral, tests must not collide
        config.reconnect = reconnect;
        config
    }

    /// Factory producing sessions whose owner rejects every channel open.
    struct BrokenChannelFactory {
        connects: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory for BrokenChannelFactory {
        async fn connect(&self) -> Result<SessionController, TunnelError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (cmd_tx, mut cmd_rx) = tokio_mpsc::channel(4);
            tokio::spawn(async move {
                while let Some(cmd) = cmd_rx.recv().await {
                    if let SessionCommand::OpenDirectTcpip { reply_tx, .. } = cmd {
                        let _ = reply_tx.send(Err(russh::Error::Disconnect));
                    }
                }
            });
            Ok(SessionController::new(cmd_tx))
        }
    }

    #[tokio::test]
    async fn run_fails_fast_on_missing_key_file() {
        let mut config = test_config(true);
        config.identity = Identity::KeyFile {
            path: "/nonexistent/id_rsa".into(),
        };
        let result = Tunnel::new(config)
            .run(&|_: &str| panic!("no prompt expected"))
            .await;
        assert!(matches!(result, Err(TunnelError::NoCredentialFound(_))));
    }

    #[tokio::test]
    async fn channel_failure_without_reconnect_aborts_the_tunnel() {
        let factory = Arc::new(BrokenChannelFactory {
            connects: AtomicUsize::new(0),
        });
        let supervisor = Arc::new(SessionSupervisor::new(factory.clone(), false));
        supervisor.connect_initial().await.unwrap();

        // Learn a free port so the client knows where serve() will bind.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut config = test_config(false);
        config.port = port;
        let serve_task = tokio::spawn(serve(Arc::new(config), supervisor));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The first connection hits the broken channel and, with reconnect
        // off, must take the whole tunnel down.
        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let result = timeout(Duration::from_secs(2), serve_task)
            .await
            .expect("tunnel must abort")
            .unwrap();
        assert!(matches!(result, Err(TunnelError::ChannelError(_))));
    }

    #[tokio::test]
    async fn failed_connection_with_reconnect_restores_the_session() {
        let factory = Arc::new(BrokenChannelFactory {
            connects: AtomicUsize::new(0),
        });
        let supervisor = Arc::new(SessionSupervisor::new(factory.clone(), true));
        let session = supervisor.connect_initial().await.unwrap();

        let config = Arc::new(test_config(true));
        let (err_tx, mut err_rx) = mpsc::channel(1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (local, _) = listener.accept().await.unwrap();

        drive_connection(7, local, supervisor.clone(), config, err_tx).await;

        // channel open failed abnormally: the session was replaced…
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        let restored = supervisor.acquire().await.unwrap();
        assert!(!Arc::ptr_eq(&session, &restored));

        // …and nothing fatal reached the tunnel-wide channel (the sender is
        // gone, so the queue closes empty)
        assert!(matches!(
            timeout(Duration::from_millis(50), err_rx.recv()).await,
            Ok(None)
        ));
        let _ = client.read(&mut [0u8; 8]).await;
    }

    #[tokio::test]
    async fn failed_connection_without_reconnect_reports_fatal() {
        let factory = Arc::new(BrokenChannelFactory {
            connects: AtomicUsize::new(0),
        });
        let supervisor = Arc::new(SessionSupervisor::new(factory.clone(), false));
        supervisor.connect_initial().await.unwrap();

        let config = Arc::new(test_config(false));
        let (err_tx, mut err_rx) = mpsc::channel(1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (local, _) = listener.accept().await.unwrap();

        drive_connection(8, local, supervisor.clone(), config, err_tx).await;

        let fatal = err_rx.recv().await.unwrap();
        assert!(matches!(fatal, TunnelError::ChannelError(_)));
        // no replacement session was built
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }
}
