//! Conversion between JSON rows and SQLite values.

use crate::error::{CoreError, CoreResult};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde_json::{Number, Value};
use tallydb_sync_protocol::Row;

/// Converts a JSON value to the SQLite value it is stored as.
///
/// Booleans become 0/1; arrays and objects are stored as JSON text.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Converts a column value read from SQLite to JSON.
pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

/// Runs a read-only query and collects every row as a JSON object keyed by
/// column name.
pub fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> CoreResult<Vec<Row>> {
    let mut stmt = conn.prepare_cached(sql)?;
    if !stmt.readonly() {
        return Err(CoreError::invalid_operation("query statements must be read-only"));
    }
    let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
    let sql_params: Vec<SqlValue> = params.iter().map(to_sql).collect();

    let mut rows = stmt.query(params_from_iter(sql_params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (i, name) in names.iter().enumerate() {
            record.insert(name.clone(), from_sql(row.get_ref(i)?));
        }
        out.push(record);
    }
    Ok(out)
}
