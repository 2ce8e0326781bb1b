//! Connection state and sync status.

use crate::error::{ErrorClass, SyncError, SyncResult};
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::info;

/// Lifecycle state of the connection supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Nothing opened yet.
    #[default]
    Uninitialized,
    /// Opening the local store.
    Initializing,
    /// Store ready; no credential, uploads paused.
    LocalOnly,
    /// A credential is available; the upload engine runs.
    Connected,
    /// Shut down. Terminal.
    Closed,
}

impl ConnectionState {
    /// Returns true if moving to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Uninitialized, Initializing) => true,
            (Initializing, LocalOnly | Connected | Uninitialized) => true,
            (LocalOnly, Connected) | (Connected, LocalOnly) => true,
            _ => false,
        }
    }

    /// Returns true once the store is open and not closed.
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionState::LocalOnly | ConnectionState::Connected)
    }

    /// The state name.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Initializing => "initializing",
            ConnectionState::LocalOnly => "local_only",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the upload engine is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UploadState {
    /// Not running.
    #[default]
    Stopped,
    /// Waiting for outbox entries.
    Idle,
    /// A batch is in flight.
    Uploading {
        /// The group being uploaded.
        group_id: u64,
    },
    /// Parked until a credential becomes available.
    WaitingForCredentials,
    /// Sleeping before the next attempt.
    BackingOff {
        /// Consecutive failed attempts.
        attempt: u32,
    },
    /// The head group failed for good and blocks the outbox.
    Blocked {
        /// The blocking group.
        group_id: u64,
    },
}

/// A failed upload as surfaced to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadError {
    /// Group that failed, if the failure happened on a batch.
    pub group_id: Option<u64>,
    /// Failure class.
    pub class: ErrorClass,
    /// Error message.
    pub message: String,
}

impl UploadError {
    pub(crate) fn from_error(group_id: Option<u64>, error: &SyncError) -> Self {
        Self {
            group_id,
            class: error.class(),
            message: error.to_string(),
        }
    }
}

/// Observable sync status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncStatus {
    /// Supervisor state.
    pub state: ConnectionState,
    /// Upload engine activity.
    pub upload: UploadState,
    /// Last upload failure; cleared by the next successful batch.
    pub last_upload_error: Option<UploadError>,
    /// When the last batch was retired.
    pub last_uploaded_at: Option<SystemTime>,
    /// Batches retired since start.
    pub uploaded_batches: u64,
    /// Remote calls made for retired batches.
    pub uploaded_operations: u64,
    /// Backoff cycles since start.
    pub retries: u64,
}

impl SyncStatus {
    /// Returns true while a batch is in flight.
    pub fn uploading(&self) -> bool {
        matches!(self.upload, UploadState::Uploading { .. })
    }

    /// Returns true if the upload engine can reach the remote.
    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Shared holder of the current status, published through a watch channel.
#[derive(Debug)]
pub(crate) struct StatusCell {
    tx: watch::Sender<SyncStatus>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.tx.borrow().state
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        self.tx.send_modify(f);
    }

    pub(crate) fn set_upload(&self, upload: UploadState) {
        self.tx.send_if_modified(|status| {
            if status.upload == upload {
                false
            } else {
                status.upload = upload;
                true
            }
        });
    }

    /// Moves to `next`, failing if the transition is illegal.
    pub(crate) fn transition(&self, next: ConnectionState) -> SyncResult<()> {
        let mut result = Ok(());
        self.tx.send_if_modified(|status| {
            let current = status.state;
            if current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                result = Err(SyncError::InvalidStateTransition {
                    from: current.to_string(),
                    to: next.to_string(),
                });
                return false;
            }
            info!(from = %current, to = %next, "connection state changed");
            status.state = next;
            true
        });
        result
    }

    /// Flips between `LocalOnly` and `Connected` as credentials come and
    /// go. Does nothing in any other state.
    pub(crate) fn set_reachable(&self, reachable: bool) {
        let next = if reachable {
            ConnectionState::Connected
        } else {
            ConnectionState::LocalOnly
        };
        if self.state().is_ready() {
            let _ = self.transition(next);
        }
    }
}
