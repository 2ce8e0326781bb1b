//! # TallyDB Sync Engine
//!
//! Reconciles local writes with a remote store.
//!
//! This crate provides:
//! - `UploadEngine`: drains the outbox with retry, backoff and failure
//!   classification
//! - `CredentialProvider`: the credential interface the application supplies
//! - `RemoteStore` and `RestRemote`: the remote interface and a
//!   PostgREST-style HTTP mapping over any `HttpClient`
//! - `ConnectionSupervisor`: store lifecycle and connectivity status
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tallydb_sync_engine::{ConnectionSupervisor, StoreOptions, SyncConfig};
//!
//! let supervisor = ConnectionSupervisor::new(remote, SyncConfig::default());
//! let db = supervisor.init(StoreOptions::file("budget.db", schema)).await?;
//! supervisor.connect(credentials).await?;
//!
//! db.write(|txn| txn.put("transactions", &id, row))?;
//! // uploaded in the background; observe progress through supervisor.status()
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod credentials;
mod error;
mod http;
mod remote;
mod status;
mod supervisor;
mod upload;

pub use config::{RetryConfig, SyncConfig};
pub use credentials::CredentialProvider;
pub use error::{ErrorClass, SyncError, SyncResult};
pub use http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RestRemote};
pub use remote::{apply_op, RemoteStore};
pub use status::{ConnectionState, SyncStatus, UploadError, UploadState};
pub use supervisor::{ConnectionSupervisor, StoreOptions};
pub use upload::{UploadEngine, UploadOutcome};

pub use async_trait::async_trait;
