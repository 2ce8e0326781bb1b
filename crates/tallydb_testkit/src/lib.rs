//! # TallyDB Testkit
//!
//! Test utilities for TallyDB.
//!
//! This crate provides:
//! - Fixtures: the budgeting schema, sample rows and temporary databases
//! - `MemoryRemote`: an idempotent in-memory remote store with fault injection
//! - Scripted credential providers
//! - Property-based generators for outbox operations
//! - Async wait helpers for engine tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tallydb_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn uploads_a_write() {
//!     let db = TestDatabase::memory();
//!     let remote = Arc::new(MemoryRemote::new());
//!     // ... wire an UploadEngine and assert on remote.calls()
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod credentials;
pub mod fixtures;
pub mod generators;
pub mod remote;
pub mod wait;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::credentials::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::remote::*;
    pub use crate::wait::*;
}

pub use credentials::*;
pub use fixtures::*;
pub use generators::*;
pub use remote::*;
pub use wait::*;
