//! Credential resolution
//!
//! Turns an identity reference (the `ssh-agent` literal or a path to a
//! private key file) into an ordered, non-empty list of credentials for the
//! transport connector to try.

mod agent;
pub mod decrypt;
mod keyfile;

pub use agent::{is_agent_available, SshAgentClient};
pub use decrypt::{EncryptedKeyContainer, CIPHER_3DES_CBC, CIPHER_AES128_CBC};

use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::{ssh_key, PrivateKey};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TunnelError;

/// Identity reference literal selecting agent-based authentication.
pub const AGENT_IDENTITY: &str = "ssh-agent";

/// Callback for obtaining a key password. Invoked with the prompt text;
/// masking the terminal echo is the caller's concern.
pub type PasswordPrompt = dyn Fn(&str) -> std::io::Result<String> + Send + Sync;

/// How the transport should authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Identity {
    /// Ask the running ssh-agent process
    Agent,

    /// Use the private key stored at this path
    KeyFile { path: PathBuf },
}

impl Identity {
    /// Map a user-supplied identity reference to a variant.
    pub fn parse(reference: &str) -> Self {
        if reference == AGENT_IDENTITY {
            Identity::Agent
        } else {
            Identity::KeyFile {
                path: PathBuf::from(reference),
            }
        }
    }
}

/// One usable signing identity. Immutable once resolved; never persisted.
#[derive(Clone)]
pub enum Credential {
    /// A key held by the agent; signing is delegated over the agent socket.
    Agent { key: ssh_key::PublicKey },

    /// Decrypted key material loaded from a file.
    KeyFile {
        path: PathBuf,
        key: Arc<PrivateKey>,
    },
}

impl Credential {
    /// Short human-readable description for progress and error messages.
    pub fn label(&self) -> String {
        match self {
            Credential::Agent { key } => {
                if key.comment().is_empty() {
                    format!("agent key ({})", key.algorithm())
                } else {
                    format!("agent key {}", key.comment())
                }
            }
            Credential::KeyFile { path, .. } => format!("key file {}", path.display()),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // no key material in logs
        f.write_str(&self.label())
    }
}

/// Resolve an identity reference into an ordered credential list.
///
/// Agent identities yield one credential per agent-held key, in agent order;
/// an unreachable agent is [`TunnelError::AgentUnavailable`] so the caller
/// can fall back to [`default_key_path`]. File identities yield exactly one
/// credential; the prompt callback is consulted only for encrypted
/// containers.
pub async fn resolve_credentials(
    identity: &Identity,
    prompt: &PasswordPrompt,
) -> Result<Vec<Credential>, TunnelError> {
    match identity {
        Identity::Agent => {
            let mut agent = SshAgentClient::connect().await?;
            let keys = agent.list_identities().await?;
            if keys.is_empty() {
                return Err(TunnelError::NoCredentialFound(
                    "SSH agent has no keys loaded. Add keys with: ssh-add".to_string(),
                ));
            }
            info!("SSH agent offers {} key(s)", keys.len());
            Ok(keys
                .into_iter()
                .map(|key| Credential::Agent { key })
                .collect())
        }
        Identity::KeyFile { path } => {
            let key = keyfile::load_key_file(path, prompt)?;
            Ok(vec![Credential::KeyFile {
                path: path.clone(),
                key: Arc::new(key),
            }])
        }
    }
}

/// Default private key location, used as the fallback when the agent is
/// requested but unreachable.
pub fn default_key_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("id_rsa"))
}
