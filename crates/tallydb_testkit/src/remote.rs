//! In-memory remote store.
//!
//! `MemoryRemote` keeps keyed tables in memory and honors the idempotency
//! contract of the remote interface: upserts replace, and patching or
//! deleting an absent record succeeds. Faults can be queued to exercise the
//! engine's retry and blocking paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use tallydb_sync_engine::{RemoteStore, SyncError, SyncResult};
use tallydb_sync_protocol::{Credential, Row};

/// A remote call that took effect.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    /// An upsert.
    Upsert {
        /// Table.
        table: String,
        /// Record id.
        id: String,
        /// Full record.
        data: Row,
    },
    /// A partial update.
    Patch {
        /// Table.
        table: String,
        /// Record id.
        id: String,
        /// Changed fields.
        data: Row,
    },
    /// A delete.
    Delete {
        /// Table.
        table: String,
        /// Record id.
        id: String,
    },
}

impl RemoteCall {
    /// The table the call targeted.
    pub fn table(&self) -> &str {
        match self {
            RemoteCall::Upsert { table, .. }
            | RemoteCall::Patch { table, .. }
            | RemoteCall::Delete { table, .. } => table,
        }
    }

    /// The record the call targeted.
    pub fn id(&self) -> &str {
        match self {
            RemoteCall::Upsert { id, .. }
            | RemoteCall::Patch { id, .. }
            | RemoteCall::Delete { id, .. } => id,
        }
    }

    /// Short verb name: `upsert`, `patch` or `delete`.
    pub fn verb(&self) -> &'static str {
        match self {
            RemoteCall::Upsert { .. } => "upsert",
            RemoteCall::Patch { .. } => "patch",
            RemoteCall::Delete { .. } => "delete",
        }
    }
}

/// A failure to inject into the next remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Network failure; retryable.
    Transport,
    /// Server error; retryable.
    Unavailable,
    /// The credential was rejected.
    Unauthorized,
    /// A constraint violation.
    Conflict,
    /// A permanent rejection with the given status.
    Rejected(u16),
}

impl Fault {
    fn into_error(self) -> SyncError {
        match self {
            Fault::Transport => SyncError::transport_retryable("connection reset"),
            Fault::Unavailable => SyncError::transport_retryable("HTTP 503"),
            Fault::Unauthorized => SyncError::Unauthorized("HTTP 401: JWT expired".into()),
            Fault::Conflict => SyncError::Conflict("HTTP 409: duplicate key value".into()),
            Fault::Rejected(status) => SyncError::rejected(Some(status), format!("HTTP {status}")),
        }
    }
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, BTreeMap<String, Row>>,
    calls: Vec<RemoteCall>,
    attempts: usize,
    faults: VecDeque<Fault>,
    conflicts: HashSet<(String, String)>,
    required_token: Option<String>,
    tokens_seen: Vec<String>,
    delay: Option<Duration>,
}

/// An in-memory [`RemoteStore`].
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    /// Creates an empty remote that accepts any credential.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects calls whose credential token differs from `token`.
    pub fn require_token(&self, token: impl Into<String>) {
        self.state.lock().required_token = Some(token.into());
    }

    /// Delays every call, to widen the window for stop and concurrency
    /// tests.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state.lock().delay = delay;
    }

    /// Fails the next call with `fault`. Faults queue in order.
    pub fn fail_next(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Fails the next `count` calls with `fault`.
    pub fn fail_next_n(&self, fault: Fault, count: usize) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.faults.push_back(fault.clone());
        }
    }

    /// Rejects every upsert of `table`/`id` with a conflict until cleared.
    pub fn conflict_on_upsert(&self, table: &str, id: &str) {
        self.state
            .lock()
            .conflicts
            .insert((table.to_string(), id.to_string()));
    }

    /// Removes all conflict rules and queued faults.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.conflicts.clear();
        state.faults.clear();
    }

    /// The stored record, if any.
    pub fn record(&self, table: &str, id: &str) -> Option<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(id))
            .cloned()
    }

    /// Number of records stored in `table`.
    pub fn record_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Calls that took effect, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().calls.clone()
    }

    /// All calls received, including failed ones.
    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }

    /// Tokens presented, in call order.
    pub fn tokens_seen(&self) -> Vec<String> {
        self.state.lock().tokens_seen.clone()
    }

    /// Forgets recorded calls and attempts. Stored records are kept.
    pub fn reset_calls(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.attempts = 0;
        state.tokens_seen.clear();
    }

    /// Counts the call and decides whether it fails.
    async fn admit(&self, credential: &Credential, upsert_key: Option<(&str, &str)>) -> SyncResult<()> {
        let delay = {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.tokens_seen.push(credential.token.clone());
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if let Some(required) = &state.required_token {
            if *required != credential.token {
                return Err(SyncError::Unauthorized("HTTP 401: invalid token".into()));
            }
        }
        if let Some(fault) = state.faults.pop_front() {
            return Err(fault.into_error());
        }
        if let Some((table, id)) = upsert_key {
            if state
                .conflicts
                .contains(&(table.to_string(), id.to_string()))
            {
                return Err(Fault::Conflict.into_error());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upsert(
        &self,
        credential: &Credential,
        table: &str,
        id: &str,
        data: &Row,
    ) -> SyncResult<()> {
        self.admit(credential, Some((table, id))).await?;
        let mut record = data.clone();
        record.insert("id".into(), Value::String(id.to_string()));

        let mut state = self.state.lock();
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id.to_string(), record);
        state.calls.push(RemoteCall::Upsert {
            table: table.to_string(),
            id: id.to_string(),
            data: data.clone(),
        });
        Ok(())
    }

    async fn patch(
        &self,
        credential: &Credential,
        table: &str,
        id: &str,
        data: &Row,
    ) -> SyncResult<()> {
        self.admit(credential, None).await?;

        let mut state = self.state.lock();
        if let Some(record) = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(id))
        {
            for (column, value) in data {
                record.insert(column.clone(), value.clone());
            }
        }
        state.calls.push(RemoteCall::Patch {
            table: table.to_string(),
            id: id.to_string(),
            data: data.clone(),
        });
        Ok(())
    }

    async fn delete(&self, credential: &Credential, table: &str, id: &str) -> SyncResult<()> {
        self.admit(credential, None).await?;

        let mut state = self.state.lock();
        if let Some(rows) = state.tables.get_mut(table) {
            rows.remove(id);
        }
        state.calls.push(RemoteCall::Delete {
            table: table.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryRemote")
            .field("tables", &state.tables.len())
            .field("calls", &state.calls.len())
            .field("attempts", &state.attempts)
            .field("queued_faults", &state.faults.len())
            .finish()
    }
}
