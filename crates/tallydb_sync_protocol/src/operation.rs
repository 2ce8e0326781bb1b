//! Outbox operations.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A record's field set, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Kind of remote write an operation maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    /// Record was created or fully replaced. Maps to upsert-by-id.
    Put,
    /// Some fields of a record changed. Maps to partial-update-by-id.
    Patch,
    /// Record was removed. Maps to delete-by-id.
    Delete,
}

impl OpKind {
    /// Returns the code stored in the outbox.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Put => "PUT",
            OpKind::Patch => "PATCH",
            OpKind::Delete => "DELETE",
        }
    }

    /// Parses a stored code.
    pub fn parse(code: &str) -> ProtocolResult<Self> {
        match code {
            "PUT" => Ok(OpKind::Put),
            "PATCH" => Ok(OpKind::Patch),
            "DELETE" => Ok(OpKind::Delete),
            other => Err(ProtocolError::UnknownOpKind(other.to_string())),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single write intended for the remote store.
///
/// `data` carries the full row for `Put`, the changed fields for `Patch` and
/// nothing for `Delete`. The record identifier is never part of `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudOp {
    /// Target table.
    pub table: String,
    /// Operation kind.
    pub kind: OpKind,
    /// Target record identifier.
    pub id: String,
    /// Field payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Row>,
}

impl CrudOp {
    /// Creates a `Put` operation.
    pub fn put(table: impl Into<String>, id: impl Into<String>, data: Row) -> Self {
        Self {
            table: table.into(),
            kind: OpKind::Put,
            id: id.into(),
            data: Some(data),
        }
    }

    /// Creates a `Patch` operation.
    pub fn patch(table: impl Into<String>, id: impl Into<String>, data: Row) -> Self {
        Self {
            table: table.into(),
            kind: OpKind::Patch,
            id: id.into(),
            data: Some(data),
        }
    }

    /// Creates a `Delete` operation.
    pub fn delete(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind: OpKind::Delete,
            id: id.into(),
            data: None,
        }
    }

    /// Checks structural validity.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.table.is_empty() {
            return Err(ProtocolError::malformed("empty table name"));
        }
        if self.id.is_empty() {
            return Err(ProtocolError::malformed(format!(
                "empty record id for {} on {}",
                self.kind, self.table
            )));
        }
        match (self.kind, &self.data) {
            (OpKind::Delete, Some(_)) => Err(ProtocolError::malformed("DELETE carries a payload")),
            (OpKind::Put | OpKind::Patch, None) => Err(ProtocolError::malformed(format!(
                "{} on {}/{} has no payload",
                self.kind, self.table, self.id
            ))),
            (_, Some(data)) if data.contains_key("id") => Err(ProtocolError::malformed(
                "payload must not contain the id column",
            )),
            _ => Ok(()),
        }
    }

    /// Returns the payload with the identifier folded in, as sent to an
    /// upsert endpoint.
    pub fn data_with_id(&self) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), serde_json::Value::String(self.id.clone()));
        if let Some(data) = &self.data {
            for (k, v) in data {
                row.insert(k.clone(), v.clone());
            }
        }
        row
    }

    /// Encodes the payload as stored in the outbox.
    pub fn encode_data(&self) -> ProtocolResult<Option<String>> {
        self.data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(ProtocolError::from)
    }

    /// Rebuilds an operation from its stored columns.
    pub fn decode(table: String, kind: &str, id: String, data: Option<&str>) -> ProtocolResult<Self> {
        let kind = OpKind::parse(kind)?;
        let data = data.map(serde_json::from_str::<Row>).transpose()?;
        let op = Self {
            table,
            kind,
            id,
            data,
        };
        op.validate()?;
        Ok(op)
    }
}

/// An operation as persisted in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrudEntry {
    /// Outbox sequence number. Strictly increasing, never reused.
    pub seq: u64,
    /// Transaction group the entry was committed with.
    pub group_id: u64,
    /// The operation.
    #[serde(flatten)]
    pub op: CrudOp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn op_kind_codes() {
        assert_eq!(OpKind::Put.as_str(), "PUT");
        assert_eq!(OpKind::parse("PATCH").unwrap(), OpKind::Patch);
        assert_eq!(OpKind::parse("DELETE").unwrap(), OpKind::Delete);
        assert!(matches!(
            OpKind::parse("UPSERT"),
            Err(ProtocolError::UnknownOpKind(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let mut delete = CrudOp::delete("transactions", "t1");
        assert!(delete.validate().is_ok());
        delete.data = Some(Row::new());
        assert!(delete.validate().is_err());

        let mut put = CrudOp::put("transactions", "t1", row(json!({"amount_cents": 500})));
        assert!(put.validate().is_ok());
        put.data = None;
        assert!(put.validate().is_err());

        let with_id = CrudOp::patch("transactions", "t1", row(json!({"id": "t2"})));
        assert!(with_id.validate().is_err());

        assert!(CrudOp::delete("transactions", "").validate().is_err());
    }

    #[test]
    fn stored_columns_decode() {
        let op = CrudOp::put("transactions", "t1", row(json!({"amount_cents": 500})));
        let encoded = op.encode_data().unwrap();
        let decoded = CrudOp::decode(
            "transactions".into(),
            "PUT",
            "t1".into(),
            encoded.as_deref(),
        )
        .unwrap();
        assert_eq!(decoded, op);

        let bad = CrudOp::decode("transactions".into(), "PUT", "t1".into(), Some("not json"));
        assert!(matches!(bad, Err(ProtocolError::Payload(_))));
    }

    #[test]
    fn data_with_id_folds_identifier() {
        let op = CrudOp::put("users", "u1", row(json!({"email": "a@b.c"})));
        let full = op.data_with_id();
        assert_eq!(full.get("id"), Some(&json!("u1")));
        assert_eq!(full.get("email"), Some(&json!("a@b.c")));

        let delete = CrudOp::delete("users", "u1");
        assert_eq!(delete.data_with_id().len(), 1);
    }
}
