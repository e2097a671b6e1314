//! Tunnel error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("No usable credential found: {0}")]
    NoCredentialFound(String),

    #[error("SSH agent not available: {0}")]
    AgentUnavailable(String),

    #[error("SSH agent error: {0}")]
    AgentError(String),

    #[error("Unsupported key cipher: {0}")]
    UnsupportedCipher(String),

    #[error("Key decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("No credential was accepted by {0}")]
    NoAuthSucceeded(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Failed to listen on {0}: {1}")]
    ListenFailed(String, String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::Protocol(err.to_string())
    }
}

impl From<russh::keys::Error> for TunnelError {
    fn from(err: russh::keys::Error) -> Self {
        TunnelError::InvalidKey(err.to_string())
    }
}

impl TunnelError {
    /// True for errors that indicate a broken configuration rather than a
    /// transient network condition. These are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TunnelError::NoCredentialFound(_)
                | TunnelError::UnsupportedCipher(_)
                | TunnelError::DecryptionFailed(_)
                | TunnelError::InvalidKey(_)
        )
    }
}
