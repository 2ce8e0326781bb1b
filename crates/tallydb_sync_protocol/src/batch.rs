//! Upload batches and operation collapsing.

use crate::operation::{CrudEntry, CrudOp, OpKind, Row};

/// All outbox entries of one transaction group, in append order.
///
/// A batch is never persisted; it is rebuilt from the outbox on each upload
/// attempt and discarded once the attempt has an outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct CrudBatch {
    /// Transaction group identifier.
    pub group_id: u64,
    /// Member entries, ordered by sequence number.
    pub entries: Vec<CrudEntry>,
}

impl CrudBatch {
    /// Creates a batch.
    pub fn new(group_id: u64, entries: Vec<CrudEntry>) -> Self {
        Self { group_id, entries }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the batch holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sequence number of the first entry.
    pub fn first_seq(&self) -> Option<u64> {
        self.entries.first().map(|e| e.seq)
    }

    /// Sequence number of the last entry.
    pub fn last_seq(&self) -> Option<u64> {
        self.entries.last().map(|e| e.seq)
    }

    /// The operations exactly as appended.
    pub fn ops(&self) -> Vec<CrudOp> {
        self.entries.iter().map(|e| e.op.clone()).collect()
    }

    /// The operations with consecutive same-record runs collapsed.
    pub fn collapsed(&self) -> Vec<CrudOp> {
        let ops: Vec<CrudOp> = self.entries.iter().map(|e| e.op.clone()).collect();
        collapse(&ops)
    }
}

/// Collapses consecutive operations on the same record to their minimal
/// effect.
///
/// Applying the result with upsert / update-by-id / delete-by-id semantics
/// leaves every record in the same state as applying `ops` one by one.
///
/// Only adjacent operations merge. An operation on another record in
/// between may depend on the earlier state of this one (a child created
/// while its parent was still unset), so records are never reordered
/// relative to each other.
pub fn collapse(ops: &[CrudOp]) -> Vec<CrudOp> {
    let mut out: Vec<CrudOp> = Vec::with_capacity(ops.len());
    for op in ops {
        match out.last_mut() {
            Some(prev) if prev.table == op.table && prev.id == op.id => {
                *prev = merge(prev, op);
            }
            _ => out.push(op.clone()),
        }
    }
    out
}

fn merge(acc: &CrudOp, next: &CrudOp) -> CrudOp {
    match (acc.kind, next.kind) {
        // Updating an absent record is a no-op, so a patch after a delete
        // leaves the record absent.
        (_, OpKind::Delete) | (OpKind::Delete, OpKind::Patch) => {
            CrudOp::delete(next.table.clone(), next.id.clone())
        }
        (_, OpKind::Put) => next.clone(),
        (OpKind::Put, OpKind::Patch) => {
            CrudOp::put(next.table.clone(), next.id.clone(), merged(acc, next))
        }
        (OpKind::Patch, OpKind::Patch) => {
            CrudOp::patch(next.table.clone(), next.id.clone(), merged(acc, next))
        }
    }
}

fn merged(acc: &CrudOp, next: &CrudOp) -> Row {
    let mut data = acc.data.clone().unwrap_or_default();
    if let Some(extra) = &next.data {
        for (k, v) in extra {
            data.insert(k.clone(), v.clone());
        }
    }
    data
}
