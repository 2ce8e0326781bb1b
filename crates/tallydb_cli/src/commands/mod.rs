//! CLI command implementations.

pub mod discard;
pub mod outbox;
pub mod status;

use std::path::Path;
use tallydb_core::{Config, Database, Schema};

/// Opens an existing store. Internal tables need no schema, so the
/// application's tables are left undeclared.
pub fn open_existing(path: &Path) -> Result<Database, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No database found at {:?}", path).into());
    }
    let config = Config::new().create_if_missing(false);
    Ok(Database::open_with_config(path, Schema::empty(), config)?)
}
