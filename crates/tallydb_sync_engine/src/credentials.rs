//! Credential lifecycle.
//!
//! The application supplies a [`CredentialProvider`]. The engine caches the
//! last credential it fetched and re-validates it for expiry before every
//! batch; a rejected or expiring credential is dropped and fetched again.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tallydb_sync_protocol::Credential;
use tracing::debug;

/// Supplies credentials for the remote store.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetches a credential.
    ///
    /// `Ok(None)` means no credential is available and the engine should
    /// stay offline. Errors are retried with backoff.
    async fn fetch_credentials(&self) -> SyncResult<Option<Credential>>;

    /// Told when the remote rejected the last credential, so the provider
    /// can drop its own cached session token.
    fn invalidate_credentials(&self) {}
}

/// Caches the last fetched credential.
#[derive(Debug)]
pub(crate) struct CredentialCache {
    cached: Mutex<Option<Credential>>,
    leeway: Duration,
}

impl CredentialCache {
    pub(crate) fn new(leeway: Duration) -> Self {
        Self {
            cached: Mutex::new(None),
            leeway,
        }
    }

    /// Returns a valid credential, fetching one if the cache is empty or
    /// holds one about to expire. No lock is held across the fetch.
    pub(crate) async fn get(
        &self,
        provider: &dyn CredentialProvider,
    ) -> SyncResult<Option<Credential>> {
        if let Some(credential) = self.valid() {
            return Ok(Some(credential));
        }

        debug!("fetching credentials");
        let fetched = provider.fetch_credentials().await?;
        match fetched {
            Some(credential) if credential.is_expired(self.leeway) => Err(SyncError::Credentials(
                "provider returned an expired credential".into(),
            )),
            Some(credential) => {
                *self.cached.lock() = Some(credential.clone());
                Ok(Some(credential))
            }
            None => {
                self.invalidate();
                Ok(None)
            }
        }
    }

    fn valid(&self) -> Option<Credential> {
        let mut cached = self.cached.lock();
        match cached.as_ref() {
            Some(credential) if !credential.is_expired(self.leeway) => Some(credential.clone()),
            Some(_) => {
                debug!("cached credential expired");
                *cached = None;
                None
            }
            None => None,
        }
    }

    pub(crate) fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    #[cfg(test)]
    fn is_cached(&self) -> bool {
        self.cached.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        credential: Option<Credential>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl CredentialProvider for Counting {
        async fn fetch_credentials(&self) -> SyncResult<Option<Credential>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.credential.clone())
        }
    }

    fn provider(credential: Option<Credential>) -> Counting {
        Counting {
            credential,
            fetches: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn caches_until_invalidated() {
        let cache = CredentialCache::new(Duration::from_secs(1));
        let provider = provider(Some(Credential::new("https://api.example.com", "t1")));

        assert!(cache.get(&provider).await.unwrap().is_some());
        assert!(cache.get(&provider).await.unwrap().is_some());
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert!(!cache.is_cached());
        cache.get(&provider).await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expiring_credentials_are_refetched() {
        let cache = CredentialCache::new(Duration::from_secs(60));
        let provider = provider(Some(
            Credential::new("https://api.example.com", "t1").expiring_in(Duration::from_secs(10)),
        ));

        let result = cache.get(&provider).await;
        assert!(matches!(result, Err(SyncError::Credentials(_))));
        assert!(!cache.is_cached());
    }

    #[tokio::test]
    async fn no_credential_means_offline() {
        let cache = CredentialCache::new(Duration::ZERO);
        let provider = provider(None);
        assert!(cache.get(&provider).await.unwrap().is_none());
        assert!(cache.get(&provider).await.unwrap().is_none());
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 2);
    }
}
