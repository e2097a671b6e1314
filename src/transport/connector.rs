//! Transport connector
//!
//! Establishes the authenticated SSH session to the bastion host. Candidate
//! credentials are tried strictly in order, each on its own fresh TCP
//! connection so a failed attempt cannot poison the next one; the first
//! credential the bastion accepts wins.

use std::future::Future;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::session::{spawn_session_task, SessionController};
use super::SessionFactory;
use crate::auth::{Credential, SshAgentClient};
use crate::config::{HostPort, TransportConfig};
use crate::error::TunnelError;

/// Client handler for russh callbacks.
///
/// Host-key verification follows the transport configuration: the platform
/// convention is to accept whatever key the bastion presents (clients learn
/// the bastion address from trusted account metadata, and the bastion only
/// ever forwards into the user's own resources). With `accept_any` cleared
/// every key is rejected, since no known-hosts store exists here.
pub struct ClientHandler {
    accept_any: bool,
}

impl client::Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.accept_any {
            debug!(
                "Accepting bastion host key ({})",
                server_public_key.algorithm()
            );
            Ok(true)
        } else {
            warn!("Rejecting bastion host key: verification has no key store");
            Ok(false)
        }
    }
}

/// Connects to a bastion with an ordered list of credentials.
pub struct Connector {
    config: TransportConfig,
}

impl Connector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Attempt authentication with each credential in order.
    ///
    /// Returns the session and the index of the credential that succeeded.
    /// Credentials after the winning one are never tried.
    pub async fn connect(
        &self,
        bastion: &HostPort,
        credentials: &[Credential],
    ) -> Result<(SessionController, usize), TunnelError> {
        debug!(
            "Connecting to {} with {} candidate credential(s)",
            bastion,
            credentials.len()
        );

        match first_accepted(credentials.len(), |index| {
            self.try_credential(bastion, &credentials[index])
        })
        .await
        {
            Some((index, handle)) => {
                info!(
                    "Authenticated to {} with {}",
                    bastion,
                    credentials[index].label()
                );
                Ok((spawn_session_task(handle, bastion.to_string()), index))
            }
            None => Err(TunnelError::NoAuthSucceeded(bastion.to_string())),
        }
    }

    /// One full connection attempt: TCP connect, handshake, authenticate.
    async fn try_credential(
        &self,
        bastion: &HostPort,
        credential: &Credential,
    ) -> Result<client::Handle<ClientHandler>, TunnelError> {
        let addr = bastion.to_string();
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| TunnelError::ConnectionFailed(format!("cannot resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| {
                TunnelError::ConnectionFailed(format!("no address found for {}", addr))
            })?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = ClientHandler {
            accept_any: self.config.accept_any_host_key,
        };

        let mut handle = tokio::time::timeout(
            self.config.connect_timeout(),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| TunnelError::ConnectionFailed(format!("connection to {} timed out", addr)))?
        .map_err(|e| TunnelError::ConnectionFailed(e.to_string()))?;

        let user = self.config.login_user.as_str();
        let accepted = match credential {
            Credential::KeyFile { key, .. } => handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key.clone(), None))
                .await
                .map_err(|e| TunnelError::Protocol(e.to_string()))?
                .success(),
            Credential::Agent { key } => {
                let mut agent = SshAgentClient::connect().await?;
                agent.authenticate_key(&mut handle, user, key).await?
            }
        };

        if !accepted {
            return Err(TunnelError::ConnectionFailed(
                "authentication rejected by server".to_string(),
            ));
        }
        Ok(handle)
    }
}

/// A connector bound to one bastion and credential list, invoked repeatedly
/// by the reconnect supervisor.
pub struct BoundConnector {
    connector: Connector,
    bastion: HostPort,
    credentials: Vec<Credential>,
}

impl BoundConnector {
    pub fn new(connector: Connector, bastion: HostPort, credentials: Vec<Credential>) -> Self {
        Self {
            connector,
            bastion,
            credentials,
        }
    }
}

#[async_trait]
impl SessionFactory for BoundConnector {
    async fn connect(&self) -> Result<SessionController, TunnelError> {
        let (session, _) = self
            .connector
            .connect(&self.bastion, &self.credentials)
            .await?;
        Ok(session)
    }
}

/// Run `attempt` over candidate indices in order; stop at the first success.
///
/// Every failure is logged and swallowed so one bad candidate never affects
/// the rest.
async fn first_accepted<S, F, Fut>(count: usize, mut attempt: F) -> Option<(usize, S)>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<S, TunnelError>>,
{
    for index in 0..count {
        match attempt(index).await {
            Ok(success) => return Some((index, success)),
            Err(e) => {
                warn!("Authentication attempt {} failed: {}", index + 1, e);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn stops_at_first_accepted_candidate() {
        let candidates = ["one", "two", "three", "four", "five"];
        let attempts = AtomicUsize::new(0);

        let result = first_accepted(candidates.len(), |index| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if index == 2 {
                    Ok(candidates[index])
                } else {
                    Err(TunnelError::ConnectionFailed("rejected".to_string()))
                }
            }
        })
        .await;

        assert_eq!(result, Some((2, "three")));
        // candidates four and five were never tried
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_candidates_yield_none() {
        let attempts = AtomicUsize::new(0);

        let result: Option<(usize, ())> = first_accepted(3, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(TunnelError::ConnectionFailed("rejected".to_string())) }
        })
        .await;

        assert!(result.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_exhausted_immediately() {
        let result: Option<(usize, ())> =
            first_accepted(0, |_| async { unreachable!() }).await;
        assert!(result.is_none());
    }
}
