//! The mutation outbox.
//!
//! The outbox is an ordered log of pending remote writes stored in the same
//! SQLite database as the application tables, so appending to it commits or
//! rolls back together with the row changes it describes.
//!
//! # Invariants
//!
//! - Sequence numbers and group identifiers are strictly increasing and
//!   never reused, including after retirement and restarts
//!   (`AUTOINCREMENT` and a persisted counter).
//! - Entries of one group are contiguous: writers serialize on the store's
//!   single write connection.
//! - Entries are immutable; they are only ever deleted, one whole group at
//!   a time.

use crate::error::{CoreError, CoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tallydb_sync_protocol::{CrudBatch, CrudEntry, CrudOp};

/// Name of the outbox table. Live queries can depend on it to follow sync
/// progress.
pub const OUTBOX_TABLE: &str = "_tally_outbox";

/// Name of the table recording upload failures per group.
pub const FAILURES_TABLE: &str = "_tally_upload_failures";

const META_TABLE: &str = "_tally_meta";
const NEXT_GROUP_KEY: &str = "next_group_id";

const OUTBOX_DDL: &str = "
CREATE TABLE IF NOT EXISTS _tally_outbox (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    op TEXT NOT NULL,
    record_id TEXT NOT NULL,
    data TEXT
);
CREATE INDEX IF NOT EXISTS _tally_outbox_group ON _tally_outbox(group_id);
CREATE TABLE IF NOT EXISTS _tally_meta (
    key TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS _tally_upload_failures (
    group_id INTEGER PRIMARY KEY NOT NULL,
    class TEXT NOT NULL,
    message TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";

/// A recorded upload failure for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadFailure {
    /// The failing group.
    pub group_id: u64,
    /// Failure classification, as reported by the uploader.
    pub class: String,
    /// Last error message.
    pub message: String,
    /// Number of failed attempts recorded.
    pub attempts: u32,
    /// Unix seconds of the last failure.
    pub updated_at: u64,
}

/// Summary counters for the outbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    /// Pending entries.
    pub entries: u64,
    /// Pending groups.
    pub groups: u64,
    /// Lowest pending sequence number.
    pub oldest_seq: Option<u64>,
}

/// Creates the outbox tables if they don't exist.
pub(crate) fn create_tables(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(OUTBOX_DDL)?;
    Ok(())
}

/// Allocates the next transaction group identifier.
pub(crate) fn allocate_group(conn: &Connection) -> CoreResult<u64> {
    let id: i64 = conn.query_row(
        "INSERT INTO _tally_meta (key, value) VALUES (?1, 1)
         ON CONFLICT(key) DO UPDATE SET value = value + 1
         RETURNING value",
        params![NEXT_GROUP_KEY],
        |row| row.get(0),
    )?;
    Ok(id as u64)
}

/// Appends the operations of one local commit.
///
/// Must run inside the transaction that performed the row changes. Returns
/// the assigned sequence numbers in append order.
pub(crate) fn append(conn: &Connection, group_id: u64, ops: &[CrudOp]) -> CoreResult<Vec<u64>> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO _tally_outbox (group_id, table_name, op, record_id, data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut seqs = Vec::with_capacity(ops.len());
    for op in ops {
        op.validate()?;
        let data = op.encode_data()?;
        stmt.execute(params![
            group_id as i64,
            op.table,
            op.kind.as_str(),
            op.id,
            data
        ])?;
        seqs.push(conn.last_insert_rowid() as u64);
    }
    Ok(seqs)
}

/// Returns the lowest-sequence group with its entries in append order.
pub(crate) fn peek_next_group(conn: &Connection) -> CoreResult<Option<CrudBatch>> {
    let group_id: Option<i64> = conn
        .query_row(
            "SELECT group_id FROM _tally_outbox ORDER BY seq LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match group_id {
        Some(group_id) => {
            let entries = group_entries(conn, group_id as u64)?;
            Ok(Some(CrudBatch::new(group_id as u64, entries)))
        }
        None => Ok(None),
    }
}

/// Returns the entries of one group in append order.
pub(crate) fn group_entries(conn: &Connection, group_id: u64) -> CoreResult<Vec<CrudEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, group_id, table_name, op, record_id, data
         FROM _tally_outbox WHERE group_id = ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![group_id as i64], read_entry_columns)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(decode_entry(row?)?);
    }
    Ok(entries)
}

/// Lists pending entries in sequence order.
pub(crate) fn list(conn: &Connection, limit: usize, offset: usize) -> CoreResult<Vec<CrudEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT seq, group_id, table_name, op, record_id, data
         FROM _tally_outbox ORDER BY seq LIMIT ?1 OFFSET ?2",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let offset = i64::try_from(offset).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![limit, offset], read_entry_columns)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(decode_entry(row?)?);
    }
    Ok(entries)
}

/// Deletes every entry of a group, and its failure record.
///
/// Fails with `GroupNotFound` if the group has no entries.
pub(crate) fn retire(conn: &Connection, group_id: u64) -> CoreResult<usize> {
    let removed = conn.execute(
        "DELETE FROM _tally_outbox WHERE group_id = ?1",
        params![group_id as i64],
    )?;
    if removed == 0 {
        return Err(CoreError::GroupNotFound { group_id });
    }
    conn.execute(
        "DELETE FROM _tally_upload_failures WHERE group_id = ?1",
        params![group_id as i64],
    )?;
    Ok(removed)
}

/// Returns pending counters.
pub(crate) fn stats(conn: &Connection) -> CoreResult<OutboxStats> {
    let (entries, groups, oldest): (i64, i64, Option<i64>) = conn.query_row(
        "SELECT COUNT(*), COUNT(DISTINCT group_id), MIN(seq) FROM _tally_outbox",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(OutboxStats {
        entries: entries as u64,
        groups: groups as u64,
        oldest_seq: oldest.map(|s| s as u64),
    })
}

/// Records a failed upload attempt for a group, bumping its attempt count.
pub(crate) fn record_failure(
    conn: &Connection,
    group_id: u64,
    class: &str,
    message: &str,
) -> CoreResult<UploadFailure> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let attempts: i64 = conn.query_row(
        "INSERT INTO _tally_upload_failures (group_id, class, message, attempts, updated_at)
         VALUES (?1, ?2, ?3, 1, ?4)
         ON CONFLICT(group_id) DO UPDATE SET
             class = excluded.class,
             message = excluded.message,
             attempts = attempts + 1,
             updated_at = excluded.updated_at
         RETURNING attempts",
        params![group_id as i64, class, message, now],
        |row| row.get(0),
    )?;
    Ok(UploadFailure {
        group_id,
        class: class.to_string(),
        message: message.to_string(),
        attempts: attempts as u32,
        updated_at: now as u64,
    })
}

/// Returns the failure record of a group.
pub(crate) fn failure(conn: &Connection, group_id: u64) -> CoreResult<Option<UploadFailure>> {
    let failure = conn
        .query_row(
            "SELECT group_id, class, message, attempts, updated_at
             FROM _tally_upload_failures WHERE group_id = ?1",
            params![group_id as i64],
            read_failure,
        )
        .optional()?;
    Ok(failure)
}

/// Returns all failure records, oldest group first.
pub(crate) fn failures(conn: &Connection) -> CoreResult<Vec<UploadFailure>> {
    let mut stmt = conn.prepare_cached(
        "SELECT group_id, class, message, attempts, updated_at
         FROM _tally_upload_failures ORDER BY group_id",
    )?;
    let rows = stmt.query_map([], read_failure)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Removes every pending entry and failure record. Counters are kept so
/// identifiers are still never reused.
pub(crate) fn clear(conn: &Connection) -> CoreResult<usize> {
    let removed = conn.execute("DELETE FROM _tally_outbox", [])?;
    conn.execute("DELETE FROM _tally_upload_failures", [])?;
    Ok(removed)
}

type EntryColumns = (i64, i64, String, String, String, Option<String>);

fn read_entry_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn decode_entry(columns: EntryColumns) -> CoreResult<CrudEntry> {
    let (seq, group_id, table, kind, id, data) = columns;
    let (seq, group_id) = (seq as u64, group_id as u64);
    let op = CrudOp::decode(table, &kind, id, data.as_deref()).map_err(|source| {
        CoreError::CorruptEntry {
            group_id,
            seq,
            source,
        }
    })?;
    Ok(CrudEntry { seq, group_id, op })
}

fn read_failure(row: &rusqlite::Row<'_>) -> rusqlite::Result<UploadFailure> {
    Ok(UploadFailure {
        group_id: row.get::<_, i64>(0)? as u64,
        class: row.get(1)?,
        message: row.get(2)?,
        attempts: row.get::<_, i64>(3)? as u32,
        updated_at: row.get::<_, i64>(4)? as u64,
    })
}
