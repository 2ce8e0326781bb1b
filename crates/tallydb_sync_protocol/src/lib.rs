//! # TallyDB Sync Protocol
//!
//! Operation types shared by the TallyDB store and its sync engine.
//!
//! This crate provides:
//! - `CrudOp` / `CrudEntry` for outbox records
//! - `CrudBatch` for one transaction group, including operation collapsing
//! - `Credential` for authenticated remote access
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod credential;
mod error;
mod operation;

pub use batch::{collapse, CrudBatch};
pub use credential::Credential;
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{CrudEntry, CrudOp, OpKind, Row};
