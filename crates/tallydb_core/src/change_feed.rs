//! Change feed for observing committed writes.
//!
//! Every commit that touches at least one table emits a single
//! [`TableChange`] naming the affected tables, including the internal
//! outbox table when operations were appended or retired. The upload engine
//! listens here to wake up on new outbox entries.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut changes = db.subscribe_changes();
//! tokio::spawn(async move {
//!     while let Some(change) = changes.recv().await {
//!         println!("commit {} touched {:?}", change.sequence, change.tables);
//!     }
//! });
//! ```

use parking_lot::RwLock;
use std::collections::BTreeSet;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A committed change, at table granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChange {
    /// Commit sequence, strictly increasing per database instance.
    pub sequence: u64,
    /// Names of the tables the commit modified.
    pub tables: BTreeSet<String>,
}

impl TableChange {
    /// Returns true if the commit touched `table`.
    pub fn touches(&self, table: &str) -> bool {
        self.tables.contains(table)
    }
}

/// Distributes committed changes to subscribers.
///
/// Emits only committed changes, in commit order. Disconnected subscribers
/// are dropped on the next emit.
#[derive(Default)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<UnboundedSender<TableChange>>>,
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to all future changes.
    pub fn subscribe(&self) -> UnboundedReceiver<TableChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Emits a change to every live subscriber.
    pub fn emit(&self, change: &TableChange) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Drops every subscriber, ending their streams.
    pub(crate) fn close(&self) {
        self.subscribers.write().clear();
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(sequence: u64, tables: &[&str]) -> TableChange {
        TableChange {
            sequence,
            tables: tables.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn subscribers_receive_in_order() {
        let feed = ChangeFeed::new();
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();

        feed.emit(&change(1, &["users"]));
        feed.emit(&change(2, &["transactions", "_tally_outbox"]));

        for rx in [&mut a, &mut b] {
            assert_eq!(rx.try_recv().unwrap().sequence, 1);
            let second = rx.try_recv().unwrap();
            assert_eq!(second.sequence, 2);
            assert!(second.touches("_tally_outbox"));
        }
    }

    #[test]
    fn dropped_subscribers_are_removed() {
        let feed = ChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);
        feed.emit(&change(1, &["users"]));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn close_ends_streams() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();
        feed.close();
        assert!(rx.try_recv().is_err());
        assert_eq!(feed.subscriber_count(), 0);
    }
}
