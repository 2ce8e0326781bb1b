//! Database facade.

use crate::change_feed::{ChangeFeed, TableChange};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::live_query::{LiveQueryRegistry, Subscription};
use crate::outbox::{self, OutboxStats, UploadFailure, FAILURES_TABLE, OUTBOX_TABLE};
use crate::row::query_rows;
use crate::schema::{quote_ident, Schema};
use crate::transaction::{TouchedTables, WriteMode, WriteTransaction};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Transaction, TransactionBehavior};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tallydb_sync_protocol::{CrudBatch, CrudEntry, Row};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// The local store.
///
/// `Database` owns one write connection, through which every transaction is
/// serialized with `BEGIN IMMEDIATE`, and for file databases in WAL mode a
/// second read-only connection serving queries and live queries so readers
/// never wait on writers.
///
/// # Writing
///
/// ```rust,ignore
/// use tallydb_core::{Database, Schema};
/// use serde_json::json;
///
/// let db = Database::open_in_memory(schema)?;
/// let id = Database::new_record_id();
/// db.write(|txn| {
///     txn.put("transactions", &id, json!({"amount_cents": 500}).as_object().cloned().unwrap_or_default())
/// })?;
/// assert_eq!(db.pending_count()?, 1);
/// ```
///
/// Each committed write that touched a synced table appends exactly one
/// outbox group in the same SQLite transaction. Subscribers are notified
/// after commit, outside the write lock, in commit order.
pub struct Database {
    writer: Mutex<Option<Connection>>,
    reader: Mutex<Option<Connection>>,
    schema: Schema,
    config: Config,
    path: Option<PathBuf>,
    touched: TouchedTables,
    commit_seq: AtomicU64,
    publishing: Mutex<()>,
    change_feed: ChangeFeed,
    live_queries: LiveQueryRegistry,
    is_open: AtomicBool,
}

impl Database {
    /// Opens or creates a database file with the default configuration.
    pub fn open(path: &Path, schema: Schema) -> CoreResult<Self> {
        Self::open_with_config(path, schema, Config::default())
    }

    /// Opens or creates a database file.
    pub fn open_with_config(path: &Path, schema: Schema, config: Config) -> CoreResult<Self> {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        if config.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        let writer = Connection::open_with_flags(path, flags)?;
        writer.busy_timeout(config.busy_timeout)?;
        if config.wal_mode {
            let mode: String =
                writer.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            debug!(journal_mode = %mode, "configured journal");
        }
        writer.pragma_update(None, "synchronous", config.synchronous_pragma())?;

        let db = Self::init(writer, schema, config, Some(path.to_path_buf()))?;

        if db.config.wal_mode {
            let reader = Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            reader.busy_timeout(db.config.busy_timeout)?;
            *db.reader.lock() = Some(reader);
        }

        info!(path = %path.display(), wal = db.config.wal_mode, "opened database");
        Ok(db)
    }

    /// Creates an in-memory database.
    ///
    /// Queries share the write connection, so they wait on open writes.
    pub fn open_in_memory(schema: Schema) -> CoreResult<Self> {
        let writer = Connection::open_in_memory()?;
        Self::init(writer, schema, Config::default(), None)
    }

    fn init(
        writer: Connection,
        schema: Schema,
        config: Config,
        path: Option<PathBuf>,
    ) -> CoreResult<Self> {
        {
            let tx = writer.unchecked_transaction()?;
            for table in schema.tables() {
                tx.execute_batch(&table.create_sql())?;
            }
            outbox::create_tables(&tx)?;
            tx.commit()?;
        }

        let touched: TouchedTables = Arc::default();
        let hook_tables = Arc::clone(&touched);
        writer.update_hook(Some(
            move |_action, _db: &str, table: &str, _rowid: i64| {
                hook_tables.lock().insert(table.to_string());
            },
        ));

        Ok(Self {
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(None),
            schema,
            config,
            path,
            touched,
            commit_seq: AtomicU64::new(0),
            publishing: Mutex::new(()),
            change_feed: ChangeFeed::new(),
            live_queries: LiveQueryRegistry::default(),
            is_open: AtomicBool::new(true),
        })
    }

    /// Generates a new record identifier (UUID v4).
    #[must_use]
    pub fn new_record_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Runs an application write transaction.
    ///
    /// Typed writes to synced tables are appended to the outbox as one group
    /// in the same transaction. If `f` returns an error, nothing persists.
    pub fn write<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> CoreResult<T>,
    {
        self.run_write(WriteMode::Tracked, f)
    }

    /// Applies remote-origin changes.
    ///
    /// Used by the pull path: rows change and subscribers are notified like
    /// any other commit, but no outbox entries are captured.
    pub fn write_remote<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> CoreResult<T>,
    {
        self.run_write(WriteMode::Remote, f)
    }

    fn run_write<F, T>(&self, mode: WriteMode, f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut WriteTransaction<'_>) -> CoreResult<T>,
    {
        let mut writer = self.writer.lock();
        let conn = writer.as_mut().ok_or(CoreError::DatabaseClosed)?;
        self.touched.lock().clear();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut txn = WriteTransaction::new(tx, &self.schema, Arc::clone(&self.touched), mode);
        let value = f(&mut txn)?;
        txn.commit()?;

        let tables = std::mem::take(&mut *self.touched.lock());
        let publishing = self.publishing.lock();
        drop(writer);
        self.publish(tables);
        drop(publishing);
        Ok(value)
    }

    /// Runs an engine-internal transaction on the write connection.
    fn internal_write<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Transaction<'_>, &mut BTreeSet<String>) -> CoreResult<T>,
    {
        let mut writer = self.writer.lock();
        let conn = writer.as_mut().ok_or(CoreError::DatabaseClosed)?;
        self.touched.lock().clear();

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut extra = BTreeSet::new();
        let value = f(&tx, &mut extra)?;
        tx.commit()?;

        let mut tables = std::mem::take(&mut *self.touched.lock());
        tables.extend(extra);
        let publishing = self.publishing.lock();
        drop(writer);
        self.publish(tables);
        drop(publishing);
        Ok(value)
    }

    fn publish(&self, tables: BTreeSet<String>) {
        if tables.is_empty() {
            return;
        }
        let sequence = self.commit_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let change = TableChange { sequence, tables };
        self.live_queries.on_commit(&change.tables);
        self.change_feed.emit(&change);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    fn with_reader<F, T>(&self, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection) -> CoreResult<T>,
    {
        self.ensure_open()?;
        {
            let reader = self.reader.lock();
            if let Some(conn) = reader.as_ref() {
                return f(conn);
            }
        }
        let writer = self.writer.lock();
        let conn = writer.as_ref().ok_or(CoreError::DatabaseClosed)?;
        f(conn)
    }

    /// Runs a read-only query against the latest committed state.
    pub fn query(&self, sql: &str, params: &[Value]) -> CoreResult<Vec<Row>> {
        self.with_reader(|conn| query_rows(conn, sql, params))
    }

    /// Reads one record by id.
    pub fn get(&self, table: &str, id: &str) -> CoreResult<Option<Row>> {
        self.schema.require(table)?;
        let sql = format!("SELECT * FROM {} WHERE id = ?1", quote_ident(table));
        let mut rows = self.query(&sql, &[Value::String(id.to_string())])?;
        Ok(rows.pop())
    }

    /// Subscribes to a live query.
    ///
    /// `tables` lists the tables whose commits re-evaluate the query. Both
    /// schema tables and the internal outbox and failure tables may be
    /// named.
    pub fn watch<I, S>(
        self: &Arc<Self>,
        sql: &str,
        params: Vec<Value>,
        tables: I,
    ) -> CoreResult<Subscription>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_open()?;
        let tables: BTreeSet<String> = tables.into_iter().map(Into::into).collect();
        if tables.is_empty() {
            return Err(CoreError::invalid_operation(
                "a live query needs at least one dependency table",
            ));
        }
        for table in &tables {
            if table != OUTBOX_TABLE && table != FAILURES_TABLE {
                self.schema.require(table)?;
            }
        }

        let state = self.live_queries.register(tables);
        debug!(sql, "registered live query");
        Ok(Subscription::new(
            Arc::clone(self),
            state,
            sql.to_string(),
            params,
        ))
    }

    /// Subscribes to table-level commit notifications.
    pub fn subscribe_changes(&self) -> UnboundedReceiver<TableChange> {
        self.change_feed.subscribe()
    }

    /// Sequence of the latest published commit.
    #[must_use]
    pub fn commit_sequence(&self) -> u64 {
        self.commit_seq.load(Ordering::Acquire)
    }

    /// Number of active live queries.
    #[must_use]
    pub fn live_query_count(&self) -> usize {
        self.live_queries.len()
    }

    pub(crate) fn live_queries(&self) -> &LiveQueryRegistry {
        &self.live_queries
    }

    // ========================================================================
    // Outbox
    // ========================================================================

    /// Returns the oldest pending group, entries in append order.
    pub fn peek_next_group(&self) -> CoreResult<Option<CrudBatch>> {
        self.with_reader(outbox::peek_next_group)
    }

    /// Returns the entries of one group.
    pub fn group_entries(&self, group_id: u64) -> CoreResult<Vec<CrudEntry>> {
        self.with_reader(|conn| outbox::group_entries(conn, group_id))
    }

    /// Deletes every entry of a group after it was applied remotely.
    ///
    /// Fails with `GroupNotFound` if the group is already gone.
    pub fn retire_group(&self, group_id: u64) -> CoreResult<usize> {
        let removed = self.internal_write(|tx, _| outbox::retire(tx, group_id))?;
        debug!(group_id, removed, "retired outbox group");
        Ok(removed)
    }

    /// Number of pending outbox entries.
    pub fn pending_count(&self) -> CoreResult<u64> {
        Ok(self.outbox_stats()?.entries)
    }

    /// Pending outbox counters.
    pub fn outbox_stats(&self) -> CoreResult<OutboxStats> {
        self.with_reader(outbox::stats)
    }

    /// Lists pending entries in sequence order.
    pub fn list_outbox(&self, limit: usize, offset: usize) -> CoreResult<Vec<CrudEntry>> {
        self.with_reader(|conn| outbox::list(conn, limit, offset))
    }

    /// Records a failed upload attempt for a group.
    pub fn record_upload_failure(
        &self,
        group_id: u64,
        class: &str,
        message: &str,
    ) -> CoreResult<UploadFailure> {
        self.internal_write(|tx, _| outbox::record_failure(tx, group_id, class, message))
    }

    /// Returns the recorded failure of a group.
    pub fn upload_failure(&self, group_id: u64) -> CoreResult<Option<UploadFailure>> {
        self.with_reader(|conn| outbox::failure(conn, group_id))
    }

    /// Returns every recorded failure.
    pub fn upload_failures(&self) -> CoreResult<Vec<UploadFailure>> {
        self.with_reader(outbox::failures)
    }

    /// Deletes all application rows and pending outbox entries.
    ///
    /// Group and sequence counters survive, so identifiers are never reused.
    pub fn clear_all(&self) -> CoreResult<usize> {
        let removed = self.internal_write(|tx, tables| {
            for table in self.schema.tables() {
                tx.execute(&format!("DELETE FROM {}", quote_ident(&table.name)), [])?;
                tables.insert(table.name.clone());
            }
            let removed = outbox::clear(tx)?;
            tables.insert(OUTBOX_TABLE.to_string());
            tables.insert(FAILURES_TABLE.to_string());
            Ok(removed)
        })?;
        warn!(removed, "cleared local data and outbox");
        Ok(removed)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Closes the database. Live queries end and later calls fail with
    /// `DatabaseClosed`. Idempotent.
    pub fn close(&self) -> CoreResult<()> {
        if !self.is_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.live_queries.cancel_all();
        self.change_feed.close();

        if let Some(reader) = self.reader.lock().take() {
            reader.close().map_err(|(_, e)| CoreError::from(e))?;
        }
        if let Some(writer) = self.writer.lock().take() {
            writer.close().map_err(|(_, e)| CoreError::from(e))?;
        }
        info!("closed database");
        Ok(())
    }

    /// Checks if the database is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }

    /// The schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The database file, or `None` in memory.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("is_open", &self.is_open())
            .field("commit_sequence", &self.commit_sequence())
            .field("live_queries", &self.live_query_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
