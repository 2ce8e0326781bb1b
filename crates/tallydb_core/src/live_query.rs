//! Live query subscriptions.
//!
//! A [`Subscription`] re-runs its query after every commit that touches one
//! of its dependency tables and yields the result when it differs from the
//! last one delivered. Commits that land while a consumer is busy coalesce:
//! the next snapshot reflects the latest committed state, so a change that
//! alters the result is never lost even if intermediate states are skipped.
//!
//! Nothing polls. Each subscription owns a [`Notify`] that the database
//! pokes after commit, outside the write lock.

use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tallydb_sync_protocol::Row;
use tokio::sync::Notify;

/// One published query result.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    /// Commit sequence the result is at least as new as.
    pub sequence: u64,
    /// Result rows.
    pub rows: Vec<Row>,
}

#[derive(Debug)]
pub(crate) struct SubscriptionState {
    id: u64,
    tables: BTreeSet<String>,
    generation: AtomicU64,
    cancelled: AtomicBool,
    notify: Notify,
}

impl SubscriptionState {
    fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        self.notify.notify_one();
        first
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Registry of active subscriptions, keyed by id.
#[derive(Debug, Default)]
pub(crate) struct LiveQueryRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, Arc<SubscriptionState>>>,
}

impl LiveQueryRegistry {
    pub(crate) fn register(&self, tables: BTreeSet<String>) -> Arc<SubscriptionState> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let state = Arc::new(SubscriptionState {
            id,
            tables,
            generation: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        });
        self.active.lock().insert(id, Arc::clone(&state));
        state
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.active.lock().remove(&id);
    }

    /// Wakes every subscription depending on one of `tables`.
    pub(crate) fn on_commit(&self, tables: &BTreeSet<String>) {
        let affected: Vec<Arc<SubscriptionState>> = self
            .active
            .lock()
            .values()
            .filter(|s| !s.tables.is_disjoint(tables))
            .cloned()
            .collect();
        for state in affected {
            state.generation.fetch_add(1, Ordering::AcqRel);
            state.notify.notify_one();
        }
    }

    pub(crate) fn cancel_all(&self) {
        let drained: Vec<Arc<SubscriptionState>> =
            self.active.lock().drain().map(|(_, s)| s).collect();
        for state in drained {
            state.cancel();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.active.lock().len()
    }
}

/// A cloneable handle that cancels a subscription from anywhere.
#[derive(Debug, Clone)]
pub struct CancelToken {
    state: Arc<SubscriptionState>,
    db: Arc<Database>,
}

impl CancelToken {
    /// Cancels the subscription. Idempotent.
    pub fn cancel(&self) {
        if self.state.cancel() {
            self.db.live_queries().unregister(self.state.id);
        }
    }

    /// Returns true once the subscription has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }
}

/// A live query.
///
/// Call [`next`](Self::next) in a loop; it resolves to `None` once the
/// subscription is cancelled or the database is closed. Dropping the handle
/// cancels it.
#[derive(Debug)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
    db: Arc<Database>,
    sql: String,
    params: Vec<Value>,
    seen_generation: Option<u64>,
    last_rows: Option<Vec<Row>>,
}

impl Subscription {
    pub(crate) fn new(
        db: Arc<Database>,
        state: Arc<SubscriptionState>,
        sql: String,
        params: Vec<Value>,
    ) -> Self {
        Self {
            state,
            db,
            sql,
            params,
            seen_generation: None,
            last_rows: None,
        }
    }

    /// Waits for the next distinct result.
    ///
    /// The first call returns the current result immediately. Query errors
    /// are yielded without ending the subscription.
    pub async fn next(&mut self) -> Option<CoreResult<QuerySnapshot>> {
        loop {
            if self.state.is_cancelled() {
                return None;
            }

            let generation = self.state.generation.load(Ordering::Acquire);
            if self.seen_generation != Some(generation) {
                self.seen_generation = Some(generation);
                let sequence = self.db.commit_sequence();
                match self.db.query(&self.sql, &self.params) {
                    Ok(rows) => {
                        if self.last_rows.as_ref() != Some(&rows) {
                            self.last_rows = Some(rows.clone());
                            return Some(Ok(QuerySnapshot { sequence, rows }));
                        }
                    }
                    Err(CoreError::DatabaseClosed) => {
                        self.cancel();
                        return None;
                    }
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }

            self.state.notify.notified().await;
        }
    }

    /// Returns the last result delivered, if any.
    pub fn current(&self) -> Option<&[Row]> {
        self.last_rows.as_deref()
    }

    /// The tables this subscription depends on.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.state.tables
    }

    /// Cancels the subscription. Idempotent; a cancelled subscription never
    /// yields again.
    pub fn cancel(&self) {
        if self.state.cancel() {
            self.db.live_queries().unregister(self.state.id);
        }
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Returns a token that can cancel this subscription from another task.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            state: Arc::clone(&self.state),
            db: Arc::clone(&self.db),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
