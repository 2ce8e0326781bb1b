//! Write transactions.
//!
//! A [`WriteTransaction`] is handed to the closure passed to
//! [`Database::write`](crate::Database::write). Typed writes on synced
//! tables are captured as outbox operations and appended, under a freshly
//! allocated group, inside the same SQLite transaction right before it
//! commits. Returning an error from the closure rolls back rows and outbox
//! entries together.

use crate::error::{CoreError, CoreResult};
use crate::outbox;
use crate::row::{query_rows, to_sql};
use crate::schema::{quote_ident, Schema, Table, RESERVED_PREFIX};
use parking_lot::Mutex;
use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{params_from_iter, Transaction};
use serde_json::Value;
use std::collections::BTreeSet;
use std::panic::{AssertUnwindSafe, RefUnwindSafe};
use std::sync::Arc;
use tallydb_sync_protocol::{CrudOp, Row};
use tracing::debug;

/// Whether writes are captured in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteMode {
    /// Application writes: synced tables are captured.
    Tracked,
    /// Remote-origin writes from the pull path: nothing is captured.
    Remote,
}

/// Tables touched by the write connection, fed by SQLite's update hook and
/// by the authorizer installed around raw statements.
pub(crate) type TouchedTables = Arc<Mutex<BTreeSet<String>>>;

/// An open write transaction.
pub struct WriteTransaction<'a> {
    tx: Transaction<'a>,
    schema: &'a Schema,
    touched: TouchedTables,
    mode: WriteMode,
    ops: Vec<CrudOp>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(
        tx: Transaction<'a>,
        schema: &'a Schema,
        touched: TouchedTables,
        mode: WriteMode,
    ) -> Self {
        Self {
            tx,
            schema,
            touched,
            mode,
            ops: Vec::new(),
        }
    }

    /// Creates or fully replaces a record.
    ///
    /// Declared columns missing from `row` are set to null. `row` may carry
    /// an `id` field only if it equals `id`.
    pub fn put(&mut self, table: &str, id: &str, mut row: Row) -> CoreResult<()> {
        let schema = self.schema;
        let def = schema.require(table)?;
        take_id(&mut row, id)?;
        check_columns(def, &row)?;
        if id.is_empty() {
            return Err(CoreError::invalid_operation("record id must not be empty"));
        }

        let mut full = Row::new();
        for column in &def.columns {
            let value = row.remove(&column.name).unwrap_or(Value::Null);
            full.insert(column.name.clone(), value);
        }

        let mut names = vec![quote_ident("id")];
        names.extend(def.columns.iter().map(|c| quote_ident(&c.name)));
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            quote_ident(table),
            names.join(", "),
            placeholders.join(", ")
        );

        let mut values = vec![to_sql(&Value::String(id.to_string()))];
        values.extend(full.values().map(to_sql));
        self.tx
            .prepare_cached(&sql)?
            .execute(params_from_iter(values.iter()))?;

        self.capture(def, CrudOp::put(table, id, full));
        Ok(())
    }

    /// Modifies some columns of an existing record.
    ///
    /// Returns false, and captures nothing, if the record does not exist.
    pub fn patch(&mut self, table: &str, id: &str, mut changes: Row) -> CoreResult<bool> {
        let schema = self.schema;
        let def = schema.require(table)?;
        take_id(&mut changes, id)?;
        check_columns(def, &changes)?;
        if changes.is_empty() {
            return Err(CoreError::invalid_operation("patch has no fields"));
        }

        let assignments: Vec<String> = changes
            .keys()
            .enumerate()
            .map(|(i, name)| format!("{} = ?{}", quote_ident(name), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            quote_ident(table),
            assignments.join(", "),
            changes.len() + 1
        );

        let mut values: Vec<_> = changes.values().map(to_sql).collect();
        values.push(to_sql(&Value::String(id.to_string())));
        let updated = self
            .tx
            .prepare_cached(&sql)?
            .execute(params_from_iter(values.iter()))?;
        if updated == 0 {
            return Ok(false);
        }

        self.capture(def, CrudOp::patch(table, id, changes));
        Ok(true)
    }

    /// Deletes a record.
    ///
    /// Returns false, and captures nothing, if the record does not exist.
    pub fn delete(&mut self, table: &str, id: &str) -> CoreResult<bool> {
        let schema = self.schema;
        let def = schema.require(table)?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", quote_ident(table));
        let deleted = self.tx.prepare_cached(&sql)?.execute([id])?;
        if deleted == 0 {
            return Ok(false);
        }

        self.capture(def, CrudOp::delete(table, id));
        Ok(true)
    }

    /// Reads a record by id, observing this transaction's own writes.
    pub fn get(&self, table: &str, id: &str) -> CoreResult<Option<Row>> {
        self.schema.require(table)?;
        let sql = format!("SELECT * FROM {} WHERE id = ?1", quote_ident(table));
        let mut rows = query_rows(&self.tx, &sql, &[Value::String(id.to_string())])?;
        Ok(rows.pop())
    }

    /// Runs a read query inside the transaction.
    pub fn query(&self, sql: &str, params: &[Value]) -> CoreResult<Vec<Row>> {
        query_rows(&self.tx, sql, params)
    }

    /// Executes a raw statement.
    ///
    /// Application writes may only modify local-only tables this way; a
    /// statement that touches a synced table fails with `UntrackedWrite`
    /// and the whole transaction rolls back. Remote-origin transactions
    /// may touch any application table.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> CoreResult<usize> {
        let guarded: BTreeSet<String> = match self.mode {
            WriteMode::Tracked => self
                .schema
                .tables()
                .iter()
                .filter(|t| self.schema.is_synced(&t.name))
                .map(|t| t.name.clone())
                .collect(),
            WriteMode::Remote => BTreeSet::new(),
        };
        let writes: Arc<Mutex<StatementWrites>> = Arc::default();
        self.tx.authorizer(Some(write_authorizer(guarded, Arc::clone(&writes))));
        let values: Vec<_> = params.iter().map(to_sql).collect();
        let result = self.tx.execute(sql, params_from_iter(values.iter()));
        self.tx.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);

        let writes = std::mem::take(&mut *writes.lock());
        match writes.denied {
            Some(DeniedWrite::Internal(table)) => {
                return Err(CoreError::invalid_operation(format!(
                    "internal table {table} cannot be modified directly"
                )));
            }
            Some(DeniedWrite::Synced(table)) => {
                return Err(CoreError::UntrackedWrite { table });
            }
            None => {}
        }
        let changed = result?;
        self.touched.lock().extend(writes.tables);
        Ok(changed)
    }

    /// Operations captured so far, in write order.
    pub fn pending_ops(&self) -> &[CrudOp] {
        &self.ops
    }

    fn capture(&mut self, table: &Table, op: CrudOp) {
        if self.mode == WriteMode::Tracked && !table.local_only {
            self.ops.push(op);
        }
    }

    /// Appends captured operations and commits. Returns the group id when
    /// operations were captured.
    pub(crate) fn commit(self) -> CoreResult<Option<u64>> {
        let group = if self.ops.is_empty() {
            None
        } else {
            let group_id = outbox::allocate_group(&self.tx)?;
            outbox::append(&self.tx, group_id, &self.ops)?;
            debug!(group_id, ops = self.ops.len(), "captured outbox group");
            Some(group_id)
        };
        self.tx.commit()?;
        Ok(group)
    }
}

/// Tables a raw statement writes, as reported by SQLite's authorizer while
/// the statement is prepared. Unlike the update hook this also sees
/// truncating deletes.
#[derive(Debug, Default)]
struct StatementWrites {
    tables: BTreeSet<String>,
    denied: Option<DeniedWrite>,
}

#[derive(Debug)]
enum DeniedWrite {
    Internal(String),
    Synced(String),
}

fn write_authorizer(
    guarded: BTreeSet<String>,
    writes: Arc<Mutex<StatementWrites>>,
) -> impl FnMut(AuthContext<'_>) -> Authorization + Send + RefUnwindSafe + 'static {
    let writes = AssertUnwindSafe(writes);
    move |ctx: AuthContext<'_>| {
        let table = match ctx.action {
            AuthAction::Insert { table_name }
            | AuthAction::Update { table_name, .. }
            | AuthAction::Delete { table_name } => table_name,
            _ => return Authorization::Allow,
        };
        // SQLite's own catalog, written by DDL.
        if table.starts_with("sqlite_") {
            return Authorization::Allow;
        }

        let mut state = writes.lock();
        if table.starts_with(RESERVED_PREFIX) {
            state
                .denied
                .get_or_insert_with(|| DeniedWrite::Internal(table.to_string()));
            return Authorization::Deny;
        }
        if guarded.contains(table) {
            state
                .denied
                .get_or_insert_with(|| DeniedWrite::Synced(table.to_string()));
            return Authorization::Deny;
        }
        state.tables.insert(table.to_string());
        Authorization::Allow
    }
}

fn take_id(row: &mut Row, id: &str) -> CoreResult<()> {
    match row.remove("id") {
        None => Ok(()),
        Some(Value::String(s)) if s == id => Ok(()),
        Some(other) => Err(CoreError::invalid_operation(format!(
            "row id {other} does not match {id}"
        ))),
    }
}

fn check_columns(table: &Table, row: &Row) -> CoreResult<()> {
    for name in row.keys() {
        if !table.has_column(name) {
            return Err(CoreError::UnknownColumn {
                table: table.name.clone(),
                column: name.clone(),
            });
        }
    }
    Ok(())
}
