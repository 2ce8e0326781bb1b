//! Error types for TallyDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in TallyDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// SQLite error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON payload error.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// Outbox entry could not be decoded or is malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] tallydb_sync_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Table is not declared in the schema.
    #[error("unknown table: {name}")]
    UnknownTable {
        /// Name of the table.
        name: String,
    },

    /// Column is not declared for the table.
    #[error("unknown column {column} in table {table}")]
    UnknownColumn {
        /// Name of the table.
        table: String,
        /// Name of the column.
        column: String,
    },

    /// Schema definition is invalid.
    #[error("invalid schema: {message}")]
    InvalidSchema {
        /// Description of the problem.
        message: String,
    },

    /// Outbox group does not exist (already retired).
    #[error("outbox group {group_id} not found")]
    GroupNotFound {
        /// The group identifier.
        group_id: u64,
    },

    /// A stored outbox entry cannot be decoded. Its group can never be
    /// uploaded as is.
    #[error("outbox entry {seq} of group {group_id} is malformed: {source}")]
    CorruptEntry {
        /// The group the entry belongs to.
        group_id: u64,
        /// The entry's sequence number.
        seq: u64,
        /// Why decoding failed.
        #[source]
        source: tallydb_sync_protocol::ProtocolError,
    },

    /// A synced table was modified without a tracked operation.
    #[error("synced table {table} modified outside tracked writes")]
    UntrackedWrite {
        /// Name of the table.
        table: String,
    },

    /// Transaction was aborted by the caller.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,
}

impl CoreError {
    /// Creates an unknown table error.
    pub fn unknown_table(name: impl Into<String>) -> Self {
        Self::UnknownTable { name: name.into() }
    }

    /// Creates an invalid schema error.
    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    pub fn transaction_aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
