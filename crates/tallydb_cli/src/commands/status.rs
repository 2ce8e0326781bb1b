//! Status command implementation.

use super::open_existing;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use tallydb_core::{CoreError, OutboxStats, UploadFailure};

/// Store status.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    /// Database path.
    pub path: String,
    /// Database file size in bytes.
    pub file_size: u64,
    /// Outbox counters.
    pub outbox: OutboxStats,
    /// The group at the head of the outbox.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_group: Option<u64>,
    /// Groups with recorded upload failures.
    pub failures: Vec<UploadFailure>,
}

/// Runs the status command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = collect(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => print!("{}", render_text(&report)),
    }
    Ok(())
}

fn collect(path: &Path) -> Result<StatusReport, Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let head_group = match db.peek_next_group() {
        Ok(batch) => batch.map(|batch| batch.group_id),
        // Still worth reporting, so it can be discarded.
        Err(CoreError::CorruptEntry { group_id, .. }) => Some(group_id),
        Err(e) => return Err(e.into()),
    };
    let report = StatusReport {
        path: path.display().to_string(),
        file_size: std::fs::metadata(path)?.len(),
        outbox: db.outbox_stats()?,
        head_group,
        failures: db.upload_failures()?,
    };
    db.close()?;
    Ok(report)
}

fn render_text(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "TallyDB Status");
    let _ = writeln!(out, "==============");
    let _ = writeln!(out, "Path:            {}", report.path);
    let _ = writeln!(out, "File size:       {} bytes", report.file_size);
    let _ = writeln!(out, "Pending entries: {}", report.outbox.entries);
    let _ = writeln!(out, "Pending groups:  {}", report.outbox.groups);
    if let Some(head) = report.head_group {
        let _ = writeln!(out, "Head group:      {}", head);
    }

    if report.failures.is_empty() {
        let _ = writeln!(out, "No recorded upload failures.");
    } else {
        let _ = writeln!(out);
        let _ = writeln!(out, "Upload failures:");
        for failure in &report.failures {
            let _ = writeln!(
                out,
                "  group {} [{}] after {} attempt(s): {}",
                failure.group_id, failure.class, failure.attempts, failure.message
            );
        }
    }
    out
}
