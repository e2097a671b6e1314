//! Authenticated transport to the bastion host
//!
//! # Architecture
//!
//! ```text
//!   credentials ──▶ Connector ──▶ russh Handle ──▶ session owner task
//!                                                   ▲
//!                                 SessionController ┘ (cloneable)
//! ```
//!
//! The connector performs ordered credential attempts; the winning `Handle`
//! is moved into a single-owner task and everyone else talks to it through
//! [`SessionController`].

mod connector;
mod session;

pub use connector::{BoundConnector, ClientHandler, Connector};
pub use session::{spawn_session_task, SessionCommand, SessionController};

use async_trait::async_trait;

use crate::error::TunnelError;

/// Something that can produce a fresh authenticated session.
///
/// The reconnect supervisor drives reconnection through this seam; the
/// production implementation is [`BoundConnector`].
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self) -> Result<SessionController, TunnelError>;
}
