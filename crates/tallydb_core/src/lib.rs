//! # TallyDB Core
//!
//! Durable local store for TallyDB.
//!
//! This crate provides:
//! - A SQLite-backed store with typed record writes (`Database`, `WriteTransaction`)
//! - The mutation outbox, appended atomically with every synced write
//! - A table-level change feed emitted after each commit
//! - Live query subscriptions re-evaluated on relevant commits

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
mod database;
mod error;
mod live_query;
mod outbox;
mod row;
mod schema;
mod transaction;

pub use change_feed::{ChangeFeed, TableChange};
pub use config::Config;
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use live_query::{CancelToken, QuerySnapshot, Subscription};
pub use outbox::{OutboxStats, UploadFailure, FAILURES_TABLE, OUTBOX_TABLE};
pub use row::{from_sql, query_rows, to_sql};
pub use schema::{Column, ColumnType, Schema, Table, RESERVED_PREFIX};
pub use transaction::WriteTransaction;

pub use tallydb_sync_protocol::Row;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
