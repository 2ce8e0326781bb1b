//! The upload engine.
//!
//! One background task drains the outbox, oldest group first:
//!
//! 1. wait until the outbox has entries or someone calls
//!    [`trigger`](UploadEngine::trigger);
//! 2. obtain a valid credential, or park offline if there is none;
//! 3. peek the oldest group, collapse it, and apply its operations in
//!    order, stopping at the first failure;
//! 4. retire the group when every operation succeeded.
//!
//! Retryable failures back off exponentially and replay the batch from its
//! start. A rejected credential is refetched once right away. Conflicts and
//! fatal rejections are recorded in the failure ledger and block the outbox
//! until [`retry_blocked`](UploadEngine::retry_blocked) or
//! [`discard_blocked`](UploadEngine::discard_blocked) is called.
//!
//! Stopping is cooperative: the task checks for shutdown between remote
//! calls and never abandons one in flight.

use crate::config::SyncConfig;
use crate::credentials::{CredentialCache, CredentialProvider};
use crate::error::{ErrorClass, SyncError, SyncResult};
use crate::remote::{apply_op, RemoteStore};
use crate::status::{StatusCell, SyncStatus, UploadError, UploadState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tallydb_core::{CoreError, Database, TableChange, OUTBOX_TABLE};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of one batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The outbox is empty.
    Idle,
    /// No credential is available.
    Offline,
    /// A group was applied remotely and retired.
    Uploaded {
        /// The retired group.
        group_id: u64,
        /// Remote calls made.
        operations: usize,
    },
    /// The head group failed for good and blocks the outbox.
    Blocked {
        /// The blocking group.
        group_id: u64,
    },
    /// The head group was dropped without being uploaded.
    Discarded {
        /// The dropped group.
        group_id: u64,
    },
}

struct EngineShared {
    db: Arc<Database>,
    remote: Arc<dyn RemoteStore>,
    provider: Arc<dyn CredentialProvider>,
    credentials: CredentialCache,
    config: SyncConfig,
    status: Arc<StatusCell>,
    wake: Notify,
    blocked: Mutex<Option<u64>>,
    retry_requested: AtomicBool,
    in_flight: tokio::sync::Mutex<()>,
}

/// Drains the outbox against a remote store.
pub struct UploadEngine {
    shared: Arc<EngineShared>,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl UploadEngine {
    /// Creates a stopped engine.
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        provider: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Self {
        Self::with_status(db, remote, provider, config, Arc::new(StatusCell::new()))
    }

    pub(crate) fn with_status(
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        provider: Arc<dyn CredentialProvider>,
        config: SyncConfig,
        status: Arc<StatusCell>,
    ) -> Self {
        let credentials = CredentialCache::new(config.credential_leeway);
        Self {
            shared: Arc::new(EngineShared {
                db,
                remote,
                provider,
                credentials,
                config,
                status,
                wake: Notify::new(),
                blocked: Mutex::new(None),
                retry_requested: AtomicBool::new(false),
                in_flight: tokio::sync::Mutex::new(()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Starts the background task. Does nothing if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if let Some((_, handle)) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run(shared, stop_rx));
        *task = Some((stop_tx, handle));
        info!("upload engine started");
    }

    /// Stops the background task and waits for it to finish. A remote call
    /// in flight completes first; its group stays queued unless the whole
    /// batch already succeeded.
    pub async fn stop(&self) {
        let running = self.task.lock().take();
        if let Some((stop_tx, handle)) = running {
            let _ = stop_tx.send(true);
            if let Err(e) = handle.await {
                error!(error = %e, "upload task failed");
            }
            info!("upload engine stopped");
        }
    }

    /// Returns true while the background task runs.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Wakes the engine to look at the outbox now. Also cuts a backoff
    /// sleep short.
    pub fn trigger(&self) {
        self.shared.wake.notify_one();
    }

    /// Drops the cached credential and wakes the engine, so the next
    /// attempt fetches a fresh one.
    pub fn credentials_changed(&self) {
        self.shared.credentials.invalidate();
        self.trigger();
    }

    /// Lets the blocked group be attempted again, until it uploads or is
    /// rejected once more.
    pub fn retry_blocked(&self) {
        if self.shared.blocked.lock().is_some() {
            self.shared.retry_requested.store(true, Ordering::Release);
            self.trigger();
        }
    }

    /// Retires the blocked group without uploading it. Returns the group
    /// that was dropped, if one was blocking.
    pub async fn discard_blocked(&self) -> SyncResult<Option<u64>> {
        let _guard = self.shared.in_flight.lock().await;
        let Some(group_id) = self.shared.blocked.lock().take() else {
            return Ok(None);
        };
        self.shared.retry_requested.store(false, Ordering::Release);
        self.shared.discard(group_id)?;
        self.shared.status.update(|status| {
            status.last_upload_error = None;
            status.upload = UploadState::Idle;
        });
        self.trigger();
        Ok(Some(group_id))
    }

    /// The group currently blocking the outbox.
    pub fn blocked_group(&self) -> Option<u64> {
        *self.shared.blocked.lock()
    }

    /// Attempts the oldest group once, without backoff.
    ///
    /// Serialized with the background task; at most one batch is ever in
    /// flight.
    pub async fn upload_once(&self) -> SyncResult<UploadOutcome> {
        self.shared.process_next(None).await
    }

    /// Subscribes to status changes.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.shared.status.subscribe()
    }

    /// Fetches a credential ahead of the first batch. Returns whether one
    /// is available.
    pub(crate) async fn prime_credentials(&self) -> SyncResult<bool> {
        let credential = self
            .shared
            .credentials
            .get(self.shared.provider.as_ref())
            .await?;
        Ok(credential.is_some())
    }
}

impl Drop for UploadEngine {
    fn drop(&mut self) {
        if let Some((stop_tx, _)) = self.task.lock().take() {
            let _ = stop_tx.send(true);
        }
    }
}

impl std::fmt::Debug for UploadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadEngine")
            .field("running", &self.is_running())
            .field("blocked_group", &self.blocked_group())
            .finish_non_exhaustive()
    }
}

enum Wait {
    Now,
    ForWork,
    Throttle(Duration),
    Backoff(Duration),
}

async fn run(shared: Arc<EngineShared>, mut stop: watch::Receiver<bool>) {
    let mut changes = shared.db.subscribe_changes();
    let mut attempt: u32 = 0;
    let mut refreshed_after_unauthorized = false;

    loop {
        if *stop.borrow() {
            break;
        }
        if !drain(&mut changes) {
            debug!("database closed; upload task exiting");
            break;
        }

        let outcome = shared.process_next(Some(&stop)).await;
        if outcome.is_ok() {
            attempt = 0;
            refreshed_after_unauthorized = false;
        }
        let wait = match outcome {
            Ok(UploadOutcome::Uploaded { .. }) => Wait::Throttle(shared.config.upload_throttle),
            Ok(UploadOutcome::Discarded { .. }) => Wait::Now,
            Ok(UploadOutcome::Idle | UploadOutcome::Offline | UploadOutcome::Blocked { .. }) => {
                Wait::ForWork
            }
            Err(SyncError::Cancelled) => break,
            Err(SyncError::Database(CoreError::DatabaseClosed)) => break,
            Err(e) if e.class() == ErrorClass::Unauthorized && !refreshed_after_unauthorized => {
                refreshed_after_unauthorized = true;
                debug!("credential rejected; refetching");
                Wait::Now
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let delay = shared.config.retry.delay_for_attempt(attempt);
                warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "upload failed; backing off"
                );
                shared.status.update(|status| {
                    status.retries += 1;
                    status.upload = UploadState::BackingOff { attempt };
                });
                Wait::Backoff(delay)
            }
        };

        let keep_going = match wait {
            Wait::Now => true,
            Wait::ForWork => wait_for_work(&shared, &mut changes, &mut stop).await,
            Wait::Throttle(delay) => sleep_unless_stopped(delay, &mut stop, None).await,
            Wait::Backoff(delay) => sleep_unless_stopped(delay, &mut stop, Some(&shared.wake)).await,
        };
        if !keep_going {
            break;
        }
    }

    shared.status.set_upload(UploadState::Stopped);
}

/// Discards queued change notifications. Returns false once the feed is
/// closed.
fn drain(changes: &mut UnboundedReceiver<TableChange>) -> bool {
    loop {
        match changes.try_recv() {
            Ok(_) => continue,
            Err(TryRecvError::Empty) => return true,
            Err(TryRecvError::Disconnected) => return false,
        }
    }
}

/// Waits for a wake-up, a commit touching the outbox, or shutdown.
/// Returns false on shutdown.
async fn wait_for_work(
    shared: &EngineShared,
    changes: &mut UnboundedReceiver<TableChange>,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            _ = shared.wake.notified() => return true,
            _ = stop.changed() => return false,
            change = changes.recv() => match change {
                Some(change) if change.touches(OUTBOX_TABLE) => return true,
                Some(_) => continue,
                None => return false,
            },
        }
    }
}

/// Sleeps for `delay`, or less if woken. Returns false on shutdown.
async fn sleep_unless_stopped(
    delay: Duration,
    stop: &mut watch::Receiver<bool>,
    wake: Option<&Notify>,
) -> bool {
    if delay.is_zero() {
        return !*stop.borrow();
    }
    let woken = async {
        match wake {
            Some(wake) => wake.notified().await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = woken => true,
        _ = stop.changed() => false,
    }
}

impl EngineShared {
    async fn process_next(&self, stop: Option<&watch::Receiver<bool>>) -> SyncResult<UploadOutcome> {
        let _guard = self.in_flight.lock().await;

        let (group_id, head) = match self.db.peek_next_group() {
            Ok(Some(batch)) => (batch.group_id, Ok(batch)),
            Ok(None) => {
                *self.blocked.lock() = None;
                self.retry_requested.store(false, Ordering::Release);
                self.status.set_upload(UploadState::Idle);
                return Ok(UploadOutcome::Idle);
            }
            Err(e @ CoreError::CorruptEntry { group_id, .. }) => (group_id, Err(e)),
            Err(e) => return Err(e.into()),
        };

        if let Some(outcome) = self.hold_if_blocked(group_id)? {
            return Ok(outcome);
        }
        let batch = match head {
            Ok(batch) => batch,
            Err(e) => return self.handle_failure(group_id, OUTBOX_TABLE, e.into()),
        };

        let credential = match self.credentials.get(self.provider.as_ref()).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                debug!("no credential; staying offline");
                self.status.set_reachable(false);
                self.status.set_upload(UploadState::WaitingForCredentials);
                return Ok(UploadOutcome::Offline);
            }
            Err(e) => {
                self.record_error(Some(group_id), &e);
                return Err(e);
            }
        };
        self.status.set_reachable(true);
        self.status.set_upload(UploadState::Uploading { group_id });

        let ops = if self.config.collapse_operations {
            batch.collapsed()
        } else {
            batch.ops()
        };
        debug!(group_id, entries = batch.len(), ops = ops.len(), "uploading group");

        for op in &ops {
            if stop.is_some_and(|stop| *stop.borrow()) {
                debug!(group_id, "stopping mid-batch; group stays queued");
                return Err(SyncError::Cancelled);
            }
            if let Err(e) = apply_op(self.remote.as_ref(), &credential, op).await {
                return self.handle_failure(group_id, &op.table, e);
            }
        }

        match self.db.retire_group(group_id) {
            Ok(_) | Err(CoreError::GroupNotFound { .. }) => {}
            Err(e) => {
                let e = SyncError::from(e);
                self.record_error(Some(group_id), &e);
                return Err(e);
            }
        }
        {
            let mut blocked = self.blocked.lock();
            if *blocked == Some(group_id) {
                *blocked = None;
                self.retry_requested.store(false, Ordering::Release);
            }
        }

        let operations = ops.len();
        self.status.update(|status| {
            status.upload = UploadState::Idle;
            status.last_upload_error = None;
            status.last_uploaded_at = Some(SystemTime::now());
            status.uploaded_batches += 1;
            status.uploaded_operations += operations as u64;
        });
        info!(group_id, operations, "uploaded group");
        Ok(UploadOutcome::Uploaded {
            group_id,
            operations,
        })
    }

    /// Returns `Blocked` while the head group must not be attempted.
    ///
    /// A conflict or fatal failure recorded in the ledger blocks the group
    /// even for an engine that did not see it fail, so a reconnect or a
    /// restart never re-sends it unasked.
    fn hold_if_blocked(&self, group_id: u64) -> SyncResult<Option<UploadOutcome>> {
        let mut blocked = self.blocked.lock();
        match *blocked {
            Some(blocked_group) if blocked_group == group_id => {}
            other => {
                if other.is_some() {
                    // The blocking group was resolved elsewhere.
                    *blocked = None;
                    self.retry_requested.store(false, Ordering::Release);
                }
                let recorded = self.db.upload_failure(group_id)?;
                let Some(failure) = recorded.filter(|f| {
                    ErrorClass::from_name(&f.class).is_some_and(|class| class.blocks())
                }) else {
                    return Ok(None);
                };
                info!(
                    group_id,
                    class = %failure.class,
                    attempts = failure.attempts,
                    "group blocked by a recorded failure"
                );
                *blocked = Some(group_id);
            }
        }

        // A granted retry lasts until the group is retired or blocks again,
        // so transient failures in between back off as usual.
        if self.retry_requested.load(Ordering::Acquire) {
            debug!(group_id, "retrying blocked group");
            return Ok(None);
        }
        self.status.set_upload(UploadState::Blocked { group_id });
        Ok(Some(UploadOutcome::Blocked { group_id }))
    }

    fn handle_failure(
        &self,
        group_id: u64,
        table: &str,
        error: SyncError,
    ) -> SyncResult<UploadOutcome> {
        let class = error.class();
        self.record_error(Some(group_id), &error);

        match class {
            ErrorClass::Retryable => Err(error),
            ErrorClass::Unauthorized => {
                self.credentials.invalidate();
                self.provider.invalidate_credentials();
                Err(error)
            }
            ErrorClass::Conflict | ErrorClass::Fatal => {
                self.retry_requested.store(false, Ordering::Release);
                let message = error.to_string();
                let failure = self
                    .db
                    .record_upload_failure(group_id, class.as_str(), &message)?;
                error!(
                    group_id,
                    table,
                    class = %class,
                    attempts = failure.attempts,
                    error = %message,
                    "upload rejected"
                );

                if let Some(threshold) = self.config.fatal_skip_threshold {
                    if failure.attempts >= threshold {
                        self.discard(group_id)?;
                        return Ok(UploadOutcome::Discarded { group_id });
                    }
                }

                *self.blocked.lock() = Some(group_id);
                self.status.set_upload(UploadState::Blocked { group_id });
                Ok(UploadOutcome::Blocked { group_id })
            }
        }
    }

    fn discard(&self, group_id: u64) -> SyncResult<()> {
        match self.db.retire_group(group_id) {
            Ok(removed) => {
                warn!(group_id, removed, "discarded outbox group without uploading");
                Ok(())
            }
            Err(CoreError::GroupNotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn record_error(&self, group_id: Option<u64>, error: &SyncError) {
        let upload_error = UploadError::from_error(group_id, error);
        self.status
            .update(|status| status.last_upload_error = Some(upload_error));
    }
}
