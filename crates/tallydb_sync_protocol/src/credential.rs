//! Remote credentials.

use std::fmt;
use std::time::{Duration, SystemTime};

/// An endpoint and bearer token for the remote store.
///
/// Credentials are never persisted. The token is redacted from `Debug`
/// output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Base URL of the remote store.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
    /// Moment after which the token must not be used. `None` means the
    /// provider did not report an expiry.
    pub expires_at: Option<SystemTime>,
}

impl Credential {
    /// Creates a credential without a known expiry.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: token.into(),
            expires_at: None,
        }
    }

    /// Sets the expiry instant.
    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the expiry relative to now.
    pub fn expiring_in(self, ttl: Duration) -> Self {
        self.with_expiry(SystemTime::now() + ttl)
    }

    /// Returns true if the token is expired at `now`, or will be within
    /// `leeway`.
    pub fn is_expired_at(&self, now: SystemTime, leeway: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => now + leeway >= expires_at,
            None => false,
        }
    }

    /// Returns true if the token is expired now, or will be within `leeway`.
    pub fn is_expired(&self, leeway: Duration) -> bool {
        self.is_expired_at(SystemTime::now(), leeway)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
