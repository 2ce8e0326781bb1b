//! Outbox listing command implementation.

use super::open_existing;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use tallydb_sync_protocol::CrudEntry;

/// Outbox entry representation for output.
#[derive(Debug, Serialize)]
pub struct EntryInfo {
    /// Sequence number.
    pub seq: u64,
    /// Transaction group.
    pub group_id: u64,
    /// Operation kind.
    pub op: String,
    /// Target table.
    pub table: String,
    /// Target record.
    pub id: String,
    /// Payload, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<CrudEntry> for EntryInfo {
    fn from(entry: CrudEntry) -> Self {
        Self {
            seq: entry.seq,
            group_id: entry.group_id,
            op: entry.op.kind.to_string(),
            table: entry.op.table,
            id: entry.op.id,
            data: entry.op.data.map(serde_json::Value::Object),
        }
    }
}

/// Runs the outbox command.
pub fn run(
    path: &Path,
    limit: usize,
    offset: usize,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let entries = load(path, limit, offset)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        _ => print!("{}", render_text(&entries)),
    }
    Ok(())
}

fn load(
    path: &Path,
    limit: usize,
    offset: usize,
) -> Result<Vec<EntryInfo>, Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let entries = db.list_outbox(limit, offset)?;
    db.close()?;
    Ok(entries.into_iter().map(EntryInfo::from).collect())
}

fn render_text(entries: &[EntryInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Outbox ({} entries shown)", entries.len());
    let _ = writeln!(out, "================");

    let mut current_group = None;
    for entry in entries {
        if current_group != Some(entry.group_id) {
            current_group = Some(entry.group_id);
            let _ = writeln!(out, "group {}", entry.group_id);
        }
        let _ = write!(
            out,
            "  [{:08}] {:6} {}/{}",
            entry.seq, entry.op, entry.table, entry.id
        );
        if let Some(data) = &entry.data {
            let _ = write!(out, " {}", data);
        }
        out.push('\n');
    }
    out
}
