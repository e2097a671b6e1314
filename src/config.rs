//! Tunnel configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::error::TunnelError;

/// Default local bind address for the tunnel listener.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";

/// Default local port; the listener walks upward from here when busy.
pub const DEFAULT_LOCAL_PORT: u16 = 10000;

/// Fixed delay between reconnection attempts. Deliberately constant and
/// uncapped: the operator interrupts the process to give up.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Protocol-level login user on the bastion. The bastion resolves the real
/// identity from the presented key, so every client authenticates under the
/// same user. Platform convention, overridable via [`TransportConfig`].
pub const DEFAULT_LOGIN_USER: &str = "git";

/// One local tunnel endpoint mapped to one remote target.
///
/// Created once from user input when the tunnel starts; read-only afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Remote target to reach through the bastion ("host:port")
    pub target: HostPort,

    /// Bastion host carrying the SSH transport ("host:port")
    pub bastion: HostPort,

    /// Identity used to authenticate the transport
    pub identity: Identity,

    /// Local address to bind (default: 127.0.0.1)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// First local port to try (default: 10000)
    #[serde(default = "default_local_port")]
    pub port: u16,

    /// Rebuild the transport after an abnormal failure (default: true)
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
}

impl TunnelConfig {
    pub fn new(target: HostPort, bastion: HostPort, identity: Identity) -> Self {
        Self {
            target,
            bastion,
            identity,
            bind_addr: default_bind_addr(),
            port: DEFAULT_LOCAL_PORT,
            reconnect: default_reconnect(),
        }
    }
}

/// Transport-level settings and trust decisions.
///
/// The defaults encode the platform conventions: a fixed login user and no
/// host-key verification against the bastion. Both are visible here rather
/// than hardcoded at the call site so a caller can tighten them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// SSH login user on the bastion
    #[serde(default = "default_login_user")]
    pub login_user: String,

    /// Accept whatever host key the bastion presents
    #[serde(default = "default_accept_any_host_key")]
    pub accept_any_host_key: bool,

    /// Bound on TCP connect + SSH handshake, per credential attempt
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            login_user: default_login_user(),
            accept_any_host_key: true,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// A "host:port" pair, kept as parsed parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a "host:port" string. The port is mandatory: targets and
    /// bastions always arrive fully resolved from the calling layer.
    pub fn parse(s: &str) -> Result<Self, TunnelError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::ConnectionFailed(format!("missing port in \"{}\"", s)))?;
        if host.is_empty() {
            return Err(TunnelError::ConnectionFailed(format!(
                "missing host in \"{}\"",
                s
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TunnelError::ConnectionFailed(format!("bad port in \"{}\"", s)))?;
        Ok(Self::new(host, port))
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_local_port() -> u16 {
    DEFAULT_LOCAL_PORT
}

fn default_reconnect() -> bool {
    true
}

fn default_login_user() -> String {
    DEFAULT_LOGIN_USER.to_string()
}

fn default_accept_any_host_key() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    30
}
