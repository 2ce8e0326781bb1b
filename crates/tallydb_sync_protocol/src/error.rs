//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Operation kind code is not one of `PUT`, `PATCH`, `DELETE`.
    #[error("unknown operation kind: {0}")]
    UnknownOpKind(String),

    /// Operation is structurally invalid.
    #[error("malformed operation: {message}")]
    Malformed {
        /// Description of the problem.
        message: String,
    },

    /// Payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates a malformed operation error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }
}
