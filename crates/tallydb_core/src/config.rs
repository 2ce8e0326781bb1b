//! Database configuration.

use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database file if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to use SQLite's write-ahead log journal. File databases in
    /// WAL mode get a separate read connection so live queries never wait
    /// on writers.
    pub wal_mode: bool,

    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,

    /// Whether to fsync on every commit (`synchronous=FULL`) rather than
    /// only at checkpoints (`synchronous=NORMAL`).
    pub sync_on_commit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            wal_mode: true,
            busy_timeout: Duration::from_secs(5),
            sync_on_commit: true,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to use the WAL journal.
    #[must_use]
    pub const fn wal_mode(mut self, value: bool) -> Self {
        self.wal_mode = value;
        self
    }

    /// Sets the busy timeout.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets whether to sync on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    pub(crate) fn synchronous_pragma(&self) -> &'static str {
        if self.sync_on_commit {
            "FULL"
        } else {
            "NORMAL"
        }
    }
}
