//! Application schema.
//!
//! Every table has an implicit `id TEXT PRIMARY KEY` column holding the
//! record identifier. Tables are synced unless marked local-only; writes to
//! synced tables are captured in the outbox.

use crate::error::{CoreError, CoreResult};
use std::collections::HashSet;

/// Prefix reserved for engine-internal tables.
pub const RESERVED_PREFIX: &str = "_tally";

/// SQLite storage class of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// UTF-8 text.
    Text,
    /// 64-bit signed integer. Booleans are stored as 0/1.
    Integer,
    /// 64-bit float.
    Real,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Storage class.
    pub column_type: ColumnType,
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Columns, excluding the implicit `id`.
    pub columns: Vec<Column>,
    /// Whether writes stay local and are never uploaded.
    pub local_only: bool,
}

impl Table {
    /// Creates a synced table with no columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            local_only: false,
        }
    }

    /// Adds a column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(Column {
            name: name.into(),
            column_type,
        });
        self
    }

    /// Marks the table as local-only.
    #[must_use]
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Returns true if `name` is a declared column.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub(crate) fn create_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY NOT NULL",
            quote_ident(&self.name)
        );
        for column in &self.columns {
            sql.push_str(", ");
            sql.push_str(&quote_ident(&column.name));
            sql.push(' ');
            sql.push_str(column.column_type.sql());
        }
        sql.push(')');
        sql
    }

    fn validate(&self) -> CoreResult<()> {
        validate_ident(&self.name)?;
        if self.name.starts_with(RESERVED_PREFIX) {
            return Err(CoreError::invalid_schema(format!(
                "table name {} uses the reserved prefix {RESERVED_PREFIX}",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_ident(&column.name)?;
            if column.name == "id" {
                return Err(CoreError::invalid_schema(format!(
                    "table {} declares the implicit id column",
                    self.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(CoreError::invalid_schema(format!(
                    "duplicate column {} in table {}",
                    column.name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// The set of tables the store manages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    tables: Vec<Table>,
}

impl Schema {
    /// Creates a validated schema.
    pub fn new(tables: Vec<Table>) -> CoreResult<Self> {
        let mut names = HashSet::new();
        for table in &tables {
            table.validate()?;
            if !names.insert(table.name.as_str()) {
                return Err(CoreError::invalid_schema(format!(
                    "duplicate table {}",
                    table.name
                )));
            }
        }
        Ok(Self { tables })
    }

    /// A schema with no application tables. Enough to inspect the outbox.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Looks up a table.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Looks up a table or fails with `UnknownTable`.
    pub fn require(&self, name: &str) -> CoreResult<&Table> {
        self.table(name).ok_or_else(|| CoreError::unknown_table(name))
    }

    /// All tables.
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Returns true if writes to `name` are captured in the outbox.
    pub fn is_synced(&self, name: &str) -> bool {
        self.table(name).is_some_and(|t| !t.local_only)
    }
}

/// Quotes an identifier for SQL.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn validate_ident(name: &str) -> CoreResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid_schema(format!(
            "invalid identifier {name:?}"
        )))
    }
}
