//! Scripted credential providers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tallydb_sync_engine::{CredentialProvider, SyncError, SyncResult};
use tallydb_sync_protocol::Credential;

/// Endpoint used by test credentials.
pub const TEST_ENDPOINT: &str = "memory://tally";

/// A credential for [`TEST_ENDPOINT`] with the given token and no expiry.
pub fn test_credential(token: &str) -> Credential {
    Credential::new(TEST_ENDPOINT, token)
}

/// Always returns the same answer.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Option<Credential>);

impl StaticCredentials {
    /// Returns `credential` on every fetch.
    pub fn new(credential: Credential) -> Self {
        Self(Some(credential))
    }

    /// Never has a credential.
    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credential>> {
        Ok(self.0.clone())
    }
}

/// A provider whose credential can be swapped at runtime, like a session
/// that signs in, refreshes and signs out.
#[derive(Debug, Default)]
pub struct SwitchableCredentials {
    current: Mutex<Option<Credential>>,
    fetches: AtomicUsize,
    failures_remaining: AtomicUsize,
    invalidations: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
}

impl SwitchableCredentials {
    /// Starts signed out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts signed in with `credential`.
    pub fn signed_in(credential: Credential) -> Self {
        let provider = Self::default();
        provider.set(Some(credential));
        provider
    }

    /// Replaces the credential. `None` signs out.
    pub fn set(&self, credential: Option<Credential>) {
        *self.current.lock() = credential;
    }

    /// Makes the next `count` fetches fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Delays each fetch.
    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        *self.fetch_delay.lock() = delay;
    }

    /// Number of fetches so far, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Number of times the engine reported the credential as rejected.
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for SwitchableCredentials {
    async fn fetch_credentials(&self) -> SyncResult<Option<Credential>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::Credentials("session refresh failed".into()));
        }
        Ok(self.current.lock().clone())
    }

    fn invalidate_credentials(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
