//! Test fixtures and database helpers.
//!
//! Provides the budgeting schema the engine was built for, sample rows for
//! its tables, and temporary databases that clean up after themselves.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tallydb_core::{ColumnType, Database, Row, Schema, Table};
use tallydb_sync_engine::{RetryConfig, SyncConfig};
use tempfile::TempDir;

/// The budgeting schema: transactions, users and recurring rules.
pub fn budget_schema() -> Schema {
    Schema::new(vec![
        Table::new("transactions")
            .column("user_id", ColumnType::Text)
            .column("amount_cents", ColumnType::Integer)
            .column("currency", ColumnType::Text)
            .column("original_amount_cents", ColumnType::Integer)
            .column("original_currency", ColumnType::Text)
            .column("fx_rate_snapshot", ColumnType::Real)
            .column("date", ColumnType::Text)
            .column("merchant", ColumnType::Text)
            .column("category_id", ColumnType::Text)
            .column("receipt_url", ColumnType::Text)
            .column("created_at", ColumnType::Text)
            .column("updated_at", ColumnType::Text),
        Table::new("users")
            .column("email", ColumnType::Text)
            .column("license_key", ColumnType::Text)
            .column("lifetime_access", ColumnType::Integer)
            .column("base_currency", ColumnType::Text)
            .column("created_at", ColumnType::Text),
        Table::new("recurring_rules")
            .column("user_id", ColumnType::Text)
            .column("rrule_string", ColumnType::Text)
            .column("amount_cents", ColumnType::Integer)
            .column("active", ColumnType::Integer)
            .column("start_date", ColumnType::Text)
            .column("end_date", ColumnType::Text),
        Table::new("drafts")
            .column("body", ColumnType::Text)
            .local_only(),
    ])
    .expect("budget schema is valid")
}

/// Converts a JSON object literal to a `Row`.
///
/// # Panics
///
/// Panics if `value` is not an object.
pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// A transaction row with the given amount.
pub fn transaction_row(amount_cents: i64) -> Row {
    row(json!({
        "user_id": "user-1",
        "amount_cents": amount_cents,
        "currency": "USD",
        "date": "2024-03-01",
        "merchant": "Corner Store",
        "created_at": "2024-03-01T09:00:00Z",
    }))
}

/// A user row.
pub fn user_row(email: &str) -> Row {
    row(json!({
        "email": email,
        "lifetime_access": 0,
        "base_currency": "USD",
        "created_at": "2024-01-01T00:00:00Z",
    }))
}

/// A sync configuration suited to tests: no throttle, short fixed
/// backoff, no credential leeway.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig::new()
        .with_upload_throttle(Duration::ZERO)
        .with_credential_leeway(Duration::ZERO)
        .with_retry(RetryConfig::fixed(Duration::from_millis(20)))
}

/// A test database with automatic cleanup.
pub struct TestDatabase {
    /// The database instance.
    pub db: Arc<Database>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestDatabase {
    /// Creates an in-memory database with the budgeting schema.
    pub fn memory() -> Self {
        Self {
            db: Arc::new(
                Database::open_in_memory(budget_schema())
                    .expect("Failed to open in-memory database"),
            ),
            temp_dir: None,
        }
    }

    /// Creates a file database with the budgeting schema in a fresh
    /// temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("tally.db");
        let db = Database::open(&path, budget_schema()).expect("Failed to open file database");
        Self {
            db: Arc::new(db),
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("tally.db"))
    }

    /// Closes the database and opens the same file again, simulating a
    /// process restart.
    ///
    /// # Panics
    ///
    /// Panics for in-memory databases.
    pub fn reopen(&mut self) {
        let path = self.path().expect("only file databases can be reopened");
        self.db.close().expect("Failed to close database");
        self.db = Arc::new(reopen_at(&path));
    }

    /// A shared handle to the database.
    pub fn handle(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }
}

fn reopen_at(path: &Path) -> Database {
    Database::open(path, budget_schema()).expect("Failed to reopen database")
}

impl std::ops::Deref for TestDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust,ignore
/// use tallydb_testkit::with_temp_db;
///
/// #[test]
/// fn my_test() {
///     with_temp_db(|db| {
///         db.write(|txn| txn.put("users", "u1", user_row("a@example.com"))).unwrap();
///     });
/// }
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let db = TestDatabase::memory();
    f(&db)
}
