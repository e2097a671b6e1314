//! Session owner task
//!
//! A single task owns the russh `Handle` for an authenticated session. Every
//! other component holds a [`SessionController`] and sends commands through
//! an mpsc channel. This avoids `Arc<Mutex<Handle>>` lock contention,
//! deadlocks from holding locks across `.await`, and protocol violations
//! from concurrent Handle access.
//!
//! The controller only borrows the session in the ownership model: opening
//! channels is allowed from anywhere, but replacing or tearing down the
//! session is the reconnect supervisor's exclusive job.

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::connector::ClientHandler;
use crate::error::TunnelError;

/// Commands sent to the session owner task.
pub enum SessionCommand {
    /// Open a direct-tcpip channel towards the remote target
    OpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Close the SSH session
    Disconnect,
}

/// Cloneable handle for sending commands to the session owner task.
#[derive(Clone)]
pub struct SessionController {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl SessionController {
    /// Build a controller around an existing command channel.
    ///
    /// Primarily for tests; production controllers come from
    /// [`spawn_session_task`].
    pub fn new(cmd_tx: mpsc::Sender<SessionCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a direct-tcpip channel to `host:port` through this session.
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TunnelError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TunnelError::Disconnected)?
            .map_err(|e| TunnelError::ChannelError(e.to_string()))
    }

    /// Ask the owner task to close the session.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Disconnect).await;
    }

    /// Whether the owner task is still accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the session owner task, consuming the authenticated `Handle`.
pub fn spawn_session_task(handle: Handle<ClientHandler>, peer: String) -> SessionController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(64);

    tokio::spawn(async move {
        let mut handle = handle; // sole owner from here on

        debug!("Session owner task started for {}", peer);

        loop {
            match cmd_rx.recv().await {
                Some(SessionCommand::OpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                }) => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        // Channel is dropped, the server will close it
                        warn!("Caller dropped before receiving direct-tcpip result");
                    }
                }
                Some(SessionCommand::Disconnect) => {
                    info!("Disconnect requested for session to {}", peer);
                    break;
                }
                None => {
                    debug!("All controllers dropped for session to {}", peer);
                    break;
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
        debug!("Session owner task terminated for {}", peer);
    });

    SessionController { cmd_tx }
}

/// Fail every queued command with a disconnect error.
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<SessionCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            SessionCommand::OpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            SessionCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn controller_reports_closed_channel_as_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = SessionController::new(cmd_tx);
        assert!(controller.is_connected());

        drop(cmd_rx);
        assert!(!controller.is_connected());
        let result = controller
            .open_direct_tcpip("db.internal", 5432, "127.0.0.1", 0)
            .await;
        assert!(matches!(result, Err(TunnelError::Disconnected)));
    }

    #[tokio::test]
    async fn open_propagates_owner_side_failure() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = SessionController::new(cmd_tx);

        // Fake owner task: reject every open with a disconnect error.
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let SessionCommand::OpenDirectTcpip { reply_tx, .. } = cmd {
                    let _ = reply_tx.send(Err(russh::Error::Disconnect));
                }
            }
        });

        let result = controller
            .open_direct_tcpip("db.internal", 5432, "127.0.0.1", 0)
            .await;
        assert!(matches!(result, Err(TunnelError::ChannelError(_))));
    }
}
