//! Error types for consul api calls.
//!
//! Keeps reqwest details out of the rest of the workspace: everything is
//! turned into a [`DiscoveryError`] before it leaves this crate.

use relay_core::DiscoveryError;
use thiserror::Error;

/// Errors talking to the consul agent.
#[derive(Debug, Error)]
pub enum ConsulError {
    /// Connection, timeout or other transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The agent answered with a non-success status.
    #[error("unexpected status {code}: {message}")]
    Status {
        /// http status code
        code: u16,
        /// response body, if any
        message: String,
    },

    /// The response body could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The `X-Consul-Index` header was present but not a number.
    #[error("invalid index header: {0}")]
    InvalidIndex(String),

    /// Client could not be built from its configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ConsulError {
    /// Returns true for failures that may go away on their own (transport
    /// errors and 5xx answers).
    pub fn is_retryable(&self) -> bool {
        match self {
            ConsulError::Transport(_) => true,
            ConsulError::Status { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ConsulError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ConsulError::Codec(err.to_string())
        } else {
            ConsulError::Transport(err.to_string())
        }
    }
}

impl From<ConsulError> for DiscoveryError {
    fn from(err: ConsulError) -> Self {
        match err {
            ConsulError::Transport(msg) | ConsulError::Config(msg) => DiscoveryError::Transport(msg),
            ConsulError::Status { code, message } => DiscoveryError::Status { code, message },
            ConsulError::Codec(msg) => DiscoveryError::Codec(msg),
            err @ ConsulError::InvalidIndex(_) => DiscoveryError::Codec(err.to_string()),
        }
    }
}

/// Shorthand result alias for consul calls.
pub type ConsulResult<T> = Result<T, ConsulError>;
