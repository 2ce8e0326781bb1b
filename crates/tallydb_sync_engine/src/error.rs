//! Error types for the sync engine.

use tallydb_core::CoreError;
use tallydb_sync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// How the upload engine reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Transient: back off and try the batch again.
    Retryable,
    /// The credential was rejected: refresh it, then try again.
    Unauthorized,
    /// The remote rejected the batch on a constraint. Blocks the outbox.
    Conflict,
    /// The batch can never succeed as is. Blocks the outbox.
    Fatal,
}

impl ErrorClass {
    /// Stable lowercase name, as stored in the failure ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Unauthorized => "unauthorized",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Fatal => "fatal",
        }
    }

    /// Parses a name written by [`as_str`](Self::as_str).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "retryable" => Some(ErrorClass::Retryable),
            "unauthorized" => Some(ErrorClass::Unauthorized),
            "conflict" => Some(ErrorClass::Conflict),
            "fatal" => Some(ErrorClass::Fatal),
            _ => None,
        }
    }

    /// Returns true if the batch stays blocked until resolved.
    pub fn blocks(&self) -> bool {
        matches!(self, ErrorClass::Conflict | ErrorClass::Fatal)
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote rejected the credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The remote rejected a write on a constraint.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The remote rejected a write for good.
    #[error("rejected by remote{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Rejected {
        /// HTTP status, when there is one.
        status: Option<u16>,
        /// Error message.
        message: String,
    },

    /// The credential provider failed.
    #[error("credential error: {0}")]
    Credentials(String),

    /// Database error during sync.
    #[error("database error: {0}")]
    Database(#[from] CoreError),

    /// An outbox operation is malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The upload was stopped before finishing.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// The store has not been opened yet.
    #[error("store not initialized")]
    NotInitialized,

    /// The supervisor was closed.
    #[error("sync engine closed")]
    Closed,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a rejection error.
    pub fn rejected(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Classifies the error for the retry policy.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Transport { retryable, .. } => {
                if *retryable {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Fatal
                }
            }
            SyncError::Unauthorized(_) => ErrorClass::Unauthorized,
            SyncError::Conflict(_) => ErrorClass::Conflict,
            SyncError::Credentials(_) => ErrorClass::Retryable,
            // A closed store, or stored data that can never be uploaded as is.
            SyncError::Database(
                CoreError::DatabaseClosed
                | CoreError::CorruptEntry { .. }
                | CoreError::Protocol(_)
                | CoreError::Payload(_)
                | CoreError::UnknownTable { .. }
                | CoreError::UnknownColumn { .. },
            ) => ErrorClass::Fatal,
            SyncError::Database(_) => ErrorClass::Retryable,
            SyncError::Rejected { .. }
            | SyncError::Protocol(_)
            | SyncError::Cancelled
            | SyncError::InvalidStateTransition { .. }
            | SyncError::NotInitialized
            | SyncError::Closed => ErrorClass::Fatal,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Retryable | ErrorClass::Unauthorized
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            SyncError::transport_retryable("connection reset").class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            SyncError::transport_fatal("bad url").class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SyncError::Unauthorized("expired".into()).class(),
            ErrorClass::Unauthorized
        );
        assert_eq!(
            SyncError::Conflict("duplicate key".into()).class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            SyncError::Credentials("auth server down".into()).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            SyncError::Database(CoreError::DatabaseClosed).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SyncError::Database(CoreError::GroupNotFound { group_id: 1 }).class(),
            ErrorClass::Retryable
        );
        assert_eq!(
            SyncError::Database(CoreError::CorruptEntry {
                group_id: 1,
                seq: 3,
                source: ProtocolError::UnknownOpKind("BOGUS".into()),
            })
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SyncError::Database(CoreError::Protocol(ProtocolError::UnknownOpKind(
                "BOGUS".into()
            )))
            .class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SyncError::Database(CoreError::unknown_table("ledger")).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn class_names_round_trip() {
        for class in [
            ErrorClass::Retryable,
            ErrorClass::Unauthorized,
            ErrorClass::Conflict,
            ErrorClass::Fatal,
        ] {
            assert_eq!(ErrorClass::from_name(class.as_str()), Some(class));
        }
        assert_eq!(ErrorClass::from_name("sideways"), None);
    }

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(SyncError::Unauthorized("401".into()).is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(!SyncError::Conflict("409".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(ErrorClass::Conflict.blocks());
        assert!(!ErrorClass::Unauthorized.blocks());
    }

    #[test]
    fn error_display() {
        assert_eq!(SyncError::Closed.to_string(), "sync engine closed");
        assert_eq!(
            SyncError::rejected(Some(403), "forbidden").to_string(),
            "rejected by remote (403): forbidden"
        );
        assert_eq!(
            SyncError::rejected(None, "bad row").to_string(),
            "rejected by remote: bad row"
        );
    }
}
