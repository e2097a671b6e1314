//! Tunnel listener
//!
//! Owns the local TCP socket. When the requested port is busy the next one
//! is tried, without a cap: an interactive operator would rather get *a*
//! port than an error, and the effective address is reported anyway.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::TunnelError;

/// Bind `bind_addr`, starting at `port` and walking upward past ports that
/// are already in use.
///
/// Only `AddrInUse` triggers the fallback; every other bind error is real
/// and surfaces immediately. Running out of port numbers surfaces as
/// [`TunnelError::ListenFailed`] (the search is otherwise unbounded).
pub async fn bind_with_fallback(
    bind_addr: &str,
    port: u16,
) -> Result<(TcpListener, SocketAddr), TunnelError> {
    let mut port = port;
    loop {
        let addr = format!("{}:{}", bind_addr, port);
        match TcpListener::bind(&addr).await {
            Ok(listener) => {
                let local_addr = listener.local_addr()?;
                info!("Tunnel listening on {}", local_addr);
                return Ok((listener, local_addr));
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                let next = port.checked_add(1).ok_or_else(|| {
                    TunnelError::ListenFailed(
                        bind_addr.to_string(),
                        "no free port up to 65535".to_string(),
                    )
                })?;
                debug!("Port {} in use, trying {}", port, next);
                port = next;
            }
            Err(e) => {
                return Err(TunnelError::ListenFailed(addr, e.to_string()));
            }
        }
    }
}
