//! SSH agent client
//!
//! Wraps russh's [`AgentClient`] with a type-erased stream so the same code
//! talks to the `SSH_AUTH_SOCK` Unix socket or the Windows OpenSSH named
//! pipe. The agent keeps the private keys; we list its identities and
//! delegate challenge signing to it during authentication.

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info};

use crate::error::TunnelError;

/// Send-safe wrapper around [`AgentClient`] implementing the [`Signer`] trait.
///
/// russh's built-in `impl Signer for AgentClient` returns `impl Future + Send`
/// via RPITIT, and inside `authenticate_publickey_with` the generated state
/// machine borrows a local `PublicKey` across an `.await`. The compiler
/// cannot prove `Send` for that borrow (rust-lang/rust#100013), so spawned
/// futures driving the authentication stop compiling. Cloning the key into
/// the async block sidesteps the borrow entirely; the clone is ~64 bytes for
/// Ed25519 keys.
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// Connection to the system SSH agent.
pub struct SshAgentClient {
    agent: AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl SshAgentClient {
    /// Connect to the system SSH agent.
    ///
    /// On Unix, reads `SSH_AUTH_SOCK` and connects to the Unix domain socket.
    /// On Windows, connects to the OpenSSH named pipe.
    pub async fn connect() -> Result<Self, TunnelError> {
        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                TunnelError::AgentUnavailable(format!(
                    "{}. Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ))
            })?;
            debug!("Connected to SSH agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    TunnelError::AgentUnavailable(format!(
                        "{}. Make sure the OpenSSH Authentication Agent service is running.",
                        e
                    ))
                })?;
            debug!("Connected to SSH agent via named pipe");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(TunnelError::AgentUnavailable(
                "SSH agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// List the public keys currently held by the agent, in agent order.
    pub async fn list_identities(&mut self) -> Result<Vec<ssh_key::PublicKey>, TunnelError> {
        self.agent
            .request_identities()
            .await
            .map_err(|e| TunnelError::AgentError(format!("failed to list agent keys: {}", e)))
    }

    /// Try to authenticate `handle` as `user` with one specific agent-held
    /// key. Returns whether the server accepted it; signing errors surface
    /// as [`TunnelError::AgentError`].
    pub async fn authenticate_key<H>(
        &mut self,
        handle: &mut Handle<H>,
        user: &str,
        key: &ssh_key::PublicKey,
    ) -> Result<bool, TunnelError>
    where
        H: russh::client::Handler,
    {
        debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

        let result = handle
            .authenticate_publickey_with(
                user,
                key.clone(),
                None,
                &mut AgentSigner {
                    agent: &mut self.agent,
                },
            )
            .await
            .map_err(|e| {
                TunnelError::AgentError(format!("signing with key {} failed: {}", key.comment(), e))
            })?;

        if result.success() {
            info!("Agent key accepted: {}", key.comment());
            Ok(true)
        } else {
            debug!("Agent key rejected by server: {}", key.comment());
            Ok(false)
        }
    }
}

/// Quick pre-check for agent availability.
///
/// Cheap and conservative: a `true` only means the socket/pipe looks
/// reachable, the actual connection may still fail.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var("SSH_AUTH_SOCK").is_ok()
    }

    #[cfg(windows)]
    {
        // The named pipe exists whenever the agent service is installed;
        // availability is only really known at connect time.
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}
