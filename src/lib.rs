//! dbtunnel - SSH tunnel core for private database endpoints
//!
//! Opens a local TCP endpoint and forwards every accepted connection, over an
//! authenticated SSH session to a bastion host, to a database endpoint that
//! is not directly reachable. The CLI layer resolves the target and bastion
//! addresses and hands them here; this crate does the rest: credential
//! resolution (agent or key file, including legacy-encrypted containers),
//! ordered authentication attempts, the accept/relay machinery, and
//! automatic session reconnection under live traffic.
//!
//! ```no_run
//! use dbtunnel::{HostPort, Identity, Tunnel, TunnelConfig};
//!
//! # async fn example() -> Result<(), dbtunnel::TunnelError> {
//! let config = TunnelConfig::new(
//!     HostPort::parse("my-db.internal:5432")?,
//!     HostPort::parse("ssh.region.example.com:22")?,
//!     Identity::parse("ssh-agent"),
//! );
//! Tunnel::new(config)
//!     .run(&|prompt: &str| rpassword_like_prompt(prompt))
//!     .await
//! # }
//! # fn rpassword_like_prompt(_: &str) -> std::io::Result<String> { Ok(String::new()) }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod transport;
pub mod tunnel;

pub use auth::{
    default_key_path, is_agent_available, resolve_credentials, Credential, Identity,
    PasswordPrompt, AGENT_IDENTITY,
};
pub use config::{
    HostPort, TransportConfig, TunnelConfig, DEFAULT_BIND_ADDR, DEFAULT_LOCAL_PORT,
    DEFAULT_LOGIN_USER, RECONNECT_DELAY,
};
pub use error::TunnelError;
pub use transport::{Connector, SessionController, SessionFactory};
pub use tunnel::{ConnectionEnd, Tunnel};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for binaries embedding the tunnel.
///
/// Diagnostics go to stderr so that stdout stays reserved for the single
/// machine-parseable address line. `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
