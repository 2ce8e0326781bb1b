//! Discard command implementation.

use super::open_existing;
use std::path::Path;
use tracing::warn;

/// Runs the discard command.
pub fn run(path: &Path, group_id: u64) -> Result<(), Box<dyn std::error::Error>> {
    let removed = discard(path, group_id)?;
    println!("Discarded group {} ({} entries)", group_id, removed);
    Ok(())
}

fn discard(path: &Path, group_id: u64) -> Result<usize, Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let removed = db.retire_group(group_id)?;
    warn!(group_id, removed, "discarded outbox group without uploading");
    db.close()?;
    Ok(removed)
}
