//! Connection supervisor.
//!
//! Owns the local store and wires a credential provider to an upload
//! engine. The lifecycle is
//! `Uninitialized -> Initializing -> {LocalOnly, Connected} -> Closed`;
//! see [`ConnectionState`]. The outbox is never touched by a state change,
//! so no transition loses data.

use crate::config::SyncConfig;
use crate::credentials::CredentialProvider;
use crate::error::{SyncError, SyncResult};
use crate::remote::RemoteStore;
use crate::status::{ConnectionState, StatusCell, SyncStatus, UploadError};
use crate::upload::UploadEngine;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tallydb_core::{Config, CoreError, Database, Schema};
use tokio::sync::watch;
use tracing::{info, warn};

/// Where and how to open the local store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Database file; `None` keeps the store in memory.
    pub path: Option<PathBuf>,
    /// Application schema.
    pub schema: Schema,
    /// Store configuration.
    pub config: Config,
}

impl StoreOptions {
    /// A file-backed store.
    pub fn file(path: impl Into<PathBuf>, schema: Schema) -> Self {
        Self {
            path: Some(path.into()),
            schema,
            config: Config::default(),
        }
    }

    /// An in-memory store.
    pub fn in_memory(schema: Schema) -> Self {
        Self {
            path: None,
            schema,
            config: Config::default(),
        }
    }

    /// Sets the store configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    fn open(self) -> SyncResult<Database> {
        let db = match self.path {
            Some(path) => Database::open_with_config(&path, self.schema, self.config)?,
            None => Database::open_in_memory(self.schema)?,
        };
        Ok(db)
    }
}

/// Orchestrates the store, the credential provider and the upload engine.
pub struct ConnectionSupervisor {
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    status: Arc<StatusCell>,
    db: Mutex<Option<Arc<Database>>>,
    engine: tokio::sync::Mutex<Option<UploadEngine>>,
}

impl ConnectionSupervisor {
    /// Creates an uninitialized supervisor.
    pub fn new(remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self {
            remote,
            config,
            status: Arc::new(StatusCell::new()),
            db: Mutex::new(None),
            engine: tokio::sync::Mutex::new(None),
        }
    }

    /// Opens the local store. Ends in `LocalOnly`.
    ///
    /// If opening fails the supervisor returns to `Uninitialized` and
    /// `init` may be called again.
    pub async fn init(&self, options: StoreOptions) -> SyncResult<Arc<Database>> {
        self.status.transition(ConnectionState::Initializing)?;

        let opened = match tokio::task::spawn_blocking(move || options.open()).await {
            Ok(result) => result,
            Err(e) => Err(SyncError::Database(CoreError::invalid_operation(format!(
                "store open task failed: {e}"
            )))),
        };

        match opened {
            Ok(db) => {
                let db = Arc::new(db);
                *self.db.lock() = Some(Arc::clone(&db));
                self.status.transition(ConnectionState::LocalOnly)?;
                Ok(db)
            }
            Err(e) => {
                warn!(error = %e, "failed to open local store");
                self.status.transition(ConnectionState::Uninitialized)?;
                Err(e)
            }
        }
    }

    /// Starts uploading with credentials from `provider`.
    ///
    /// Fetches a credential first: the state becomes `Connected` if one is
    /// available and stays `LocalOnly` otherwise. Either way the engine runs
    /// and re-engages when [`credentials_changed`](Self::credentials_changed)
    /// is called or new writes arrive. Replaces any previous provider.
    pub async fn connect(&self, provider: Arc<dyn CredentialProvider>) -> SyncResult<()> {
        let db = self.database()?;
        let mut engine = self.engine.lock().await;
        if let Some(previous) = engine.take() {
            previous.stop().await;
        }

        let next = UploadEngine::with_status(
            db,
            Arc::clone(&self.remote),
            provider,
            self.config.clone(),
            Arc::clone(&self.status),
        );
        match next.prime_credentials().await {
            Ok(available) => self.status.set_reachable(available),
            Err(e) => {
                warn!(error = %e, "initial credential fetch failed");
                self.status.set_reachable(false);
                self.status.update(|status| {
                    status.last_upload_error = Some(UploadError::from_error(None, &e));
                });
            }
        }
        next.start();
        *engine = Some(next);
        info!(state = %self.state(), "connected upload engine");
        Ok(())
    }

    /// Stops uploading. The outbox is kept; a later `connect` resumes it.
    pub async fn disconnect(&self) -> SyncResult<()> {
        self.ensure_not_closed()?;
        if let Some(engine) = self.engine.lock().await.take() {
            engine.stop().await;
        }
        if self.state() == ConnectionState::Connected {
            self.status.transition(ConnectionState::LocalOnly)?;
        }
        Ok(())
    }

    /// Stops uploading and deletes all local data, including pending
    /// outbox entries. Used on sign-out.
    pub async fn disconnect_and_clear(&self) -> SyncResult<()> {
        self.disconnect().await?;
        let db = self.database()?;
        let removed = db.clear_all()?;
        warn!(removed, "cleared local store on disconnect");
        Ok(())
    }

    /// Stops the engine and closes the store. Pending entries stay durable
    /// on disk. Idempotent.
    pub async fn close(&self) -> SyncResult<()> {
        if self.state() == ConnectionState::Closed {
            return Ok(());
        }
        if let Some(engine) = self.engine.lock().await.take() {
            engine.stop().await;
        }
        let db = self.db.lock().take();
        if let Some(db) = db {
            db.close()?;
        }
        self.status.transition(ConnectionState::Closed)?;
        Ok(())
    }

    /// Signals that the credential provider has new credentials (sign-in,
    /// token refresh). The engine drops its cached credential and retries.
    pub async fn credentials_changed(&self) {
        if let Some(engine) = self.engine.lock().await.as_ref() {
            engine.credentials_changed();
        }
    }

    /// Wakes the upload engine.
    pub async fn trigger_upload(&self) {
        if let Some(engine) = self.engine.lock().await.as_ref() {
            engine.trigger();
        }
    }

    /// Lets the blocked group be attempted once more.
    pub async fn retry_blocked(&self) {
        if let Some(engine) = self.engine.lock().await.as_ref() {
            engine.retry_blocked();
        }
    }

    /// Drops the blocked group without uploading it.
    pub async fn discard_blocked(&self) -> SyncResult<Option<u64>> {
        match self.engine.lock().await.as_ref() {
            Some(engine) => engine.discard_blocked().await,
            None => Ok(None),
        }
    }

    /// The local store.
    pub fn database(&self) -> SyncResult<Arc<Database>> {
        match self.state() {
            ConnectionState::Closed => Err(SyncError::Closed),
            _ => self.db.lock().clone().ok_or(SyncError::NotInitialized),
        }
    }

    /// Subscribes to status changes.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// The current status.
    pub fn current_status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.status.state()
    }

    fn ensure_not_closed(&self) -> SyncResult<()> {
        if self.state() == ConnectionState::Closed {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
