//! Property-based test generators using proptest.
//!
//! Record ids are drawn from a small pool so that generated writes hit the
//! same records often enough to exercise collapsing and replay.

use proptest::prelude::*;
use serde_json::{json, Value};
use tallydb_core::{CoreResult, WriteTransaction};
use tallydb_sync_protocol::{CrudOp, Row};

/// Table the generated writes target.
pub const GENERATED_TABLE: &str = "transactions";

/// Strategy for record ids from a pool of five.
pub fn record_id_strategy() -> impl Strategy<Value = String> {
    (0u8..5).prop_map(|n| format!("t{n}"))
}

/// Strategy for merchant names.
pub fn merchant_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{2,12}").expect("Invalid regex")
}

/// Strategy for a full transaction row.
pub fn transaction_row_strategy() -> impl Strategy<Value = Row> {
    (
        -100_000i64..100_000,
        prop::sample::select(vec!["USD", "EUR", "JPY"]),
        merchant_strategy(),
    )
        .prop_map(|(amount, currency, merchant)| {
            let mut row = Row::new();
            row.insert("amount_cents".into(), json!(amount));
            row.insert("currency".into(), json!(currency));
            row.insert("merchant".into(), Value::String(merchant));
            row
        })
}

/// Strategy for a field subset to patch.
pub fn transaction_patch_strategy() -> impl Strategy<Value = Row> {
    prop_oneof![
        (-100_000i64..100_000).prop_map(|amount| {
            let mut row = Row::new();
            row.insert("amount_cents".into(), json!(amount));
            row
        }),
        merchant_strategy().prop_map(|merchant| {
            let mut row = Row::new();
            row.insert("merchant".into(), Value::String(merchant));
            row
        }),
    ]
}

/// Strategy for a valid outbox operation on [`GENERATED_TABLE`].
pub fn crud_op_strategy() -> impl Strategy<Value = CrudOp> {
    prop_oneof![
        3 => (record_id_strategy(), transaction_row_strategy())
            .prop_map(|(id, row)| CrudOp::put(GENERATED_TABLE, id, row)),
        2 => (record_id_strategy(), transaction_patch_strategy())
            .prop_map(|(id, row)| CrudOp::patch(GENERATED_TABLE, id, row)),
        1 => record_id_strategy().prop_map(|id| CrudOp::delete(GENERATED_TABLE, id)),
    ]
}

/// Strategy for a sequence of outbox operations.
pub fn crud_ops_strategy(min_ops: usize, max_ops: usize) -> impl Strategy<Value = Vec<CrudOp>> {
    prop::collection::vec(crud_op_strategy(), min_ops..max_ops)
}

/// A local write, replayed through a [`WriteTransaction`].
#[derive(Debug, Clone)]
pub enum LocalWrite {
    /// Create or replace a record.
    Put {
        /// Record id.
        id: String,
        /// Row.
        row: Row,
    },
    /// Update some fields.
    Patch {
        /// Record id.
        id: String,
        /// Changed fields.
        changes: Row,
    },
    /// Remove a record.
    Delete {
        /// Record id.
        id: String,
    },
}

impl LocalWrite {
    /// Applies the write. Patches and deletes of absent records are no-ops.
    pub fn apply(&self, txn: &mut WriteTransaction<'_>) -> CoreResult<()> {
        match self {
            LocalWrite::Put { id, row } => txn.put(GENERATED_TABLE, id, row.clone()),
            LocalWrite::Patch { id, changes } => {
                txn.patch(GENERATED_TABLE, id, changes.clone()).map(|_| ())
            }
            LocalWrite::Delete { id } => txn.delete(GENERATED_TABLE, id).map(|_| ()),
        }
    }
}

/// Strategy for a single local write.
pub fn local_write_strategy() -> impl Strategy<Value = LocalWrite> {
    prop_oneof![
        3 => (record_id_strategy(), transaction_row_strategy())
            .prop_map(|(id, row)| LocalWrite::Put { id, row }),
        2 => (record_id_strategy(), transaction_patch_strategy())
            .prop_map(|(id, changes)| LocalWrite::Patch { id, changes }),
        1 => record_id_strategy().prop_map(|id| LocalWrite::Delete { id }),
    ]
}

/// Strategy for a script of transactions, each a list of writes.
pub fn write_script_strategy(
    max_transactions: usize,
    max_writes: usize,
) -> impl Strategy<Value = Vec<Vec<LocalWrite>>> {
    prop::collection::vec(
        prop::collection::vec(local_write_strategy(), 1..max_writes.max(2)),
        1..max_transactions.max(2),
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
