use tether_core::frames::{ErrorShape, FrameError};
use tether_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    /// Gateway unreachable or the socket closed underneath us.
    #[error("connection error: {0}")]
    Connection(String),
    /// The gateway rejected the connect handshake. `retryable` is set only
    /// when a stale cached device token was evicted and a fallback
    /// credential remains for the next attempt.
    #[error("handshake rejected ({code}): {message}")]
    Auth {
        code: String,
        message: String,
        retryable: bool,
    },
    #[error("request failed ({}): {}", .0.code, .0.message)]
    Response(ErrorShape),
    #[error("not connected")]
    NotConnected,
    #[error("client disconnected")]
    Disconnected,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("identity error: {0}")]
    Identity(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Whether the reconnect loop should keep going after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Auth { retryable, .. } => *retryable,
            ClientError::Connection(_) | ClientError::Protocol(_) => true,
            _ => false,
        }
    }
}

impl From<StorageError> for ClientError {
    fn from(err: StorageError) -> Self {
        ClientError::Storage(err.to_string())
    }
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}
