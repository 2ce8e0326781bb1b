//! Configuration for the upload engine.

use rand::Rng;
use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backoff applied to retryable failures.
    pub retry: RetryConfig,
    /// Pause between consecutive successful batches.
    pub upload_throttle: Duration,
    /// A credential expiring within this window is treated as expired.
    pub credential_leeway: Duration,
    /// Whether operations on the same record within a group are collapsed
    /// before upload.
    pub collapse_operations: bool,
    /// Discard a group automatically after this many fatal failures.
    /// `None` keeps it blocking until resolved by hand.
    pub fatal_skip_threshold: Option<u32>,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            retry: RetryConfig::default(),
            upload_throttle: Duration::from_secs(1),
            credential_leeway: Duration::from_secs(30),
            collapse_operations: true,
            fatal_skip_threshold: None,
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the pause between batches.
    pub fn with_upload_throttle(mut self, throttle: Duration) -> Self {
        self.upload_throttle = throttle;
        self
    }

    /// Sets the credential expiry leeway.
    pub fn with_credential_leeway(mut self, leeway: Duration) -> Self {
        self.credential_leeway = leeway;
        self
    }

    /// Enables or disables operation collapsing.
    pub fn with_collapse_operations(mut self, collapse: bool) -> Self {
        self.collapse_operations = collapse;
        self
    }

    /// Discards a group after `failures` fatal failures.
    pub fn with_fatal_skip_threshold(mut self, failures: u32) -> Self {
        self.fatal_skip_threshold = Some(failures.max(1));
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
///
/// Retryable failures are retried indefinitely; only the delay grows.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Ceiling for any delay, jitter included.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with default values.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A fixed delay with no growth or jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay after `attempt` consecutive failures.
    ///
    /// Attempt 0 has no delay. Jitter adds up to 25% but never exceeds
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let max_secs = self.max_delay.as_secs_f64();
        let mut delay_secs = base_delay.min(max_secs);

        if self.add_jitter {
            let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.25);
            delay_secs = (delay_secs * (1.0 + jitter)).min(max_secs);
        }

        if delay_secs.is_finite() && delay_secs > 0.0 {
            Duration::from_secs_f64(delay_secs)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_upload_throttle(Duration::ZERO)
            .with_credential_leeway(Duration::from_secs(5))
            .with_collapse_operations(false)
            .with_fatal_skip_threshold(0);

        assert_eq!(config.upload_throttle, Duration::ZERO);
        assert_eq!(config.credential_leeway, Duration::from_secs(5));
        assert!(!config.collapse_operations);
        assert_eq!(config.fatal_skip_threshold, Some(1));
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert!(config.collapse_operations);
        assert_eq!(config.fatal_skip_threshold, None);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        // Jitter makes exact values unpredictable, but bounds hold.
        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(126));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        assert!(config.delay_for_attempt(5) <= Duration::from_secs(5));
        assert!(config.delay_for_attempt(u32::MAX) <= Duration::from_secs(5));
    }

    #[test]
    fn fixed_delay() {
        let config = RetryConfig::fixed(Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(config.delay_for_attempt(7), Duration::from_millis(10));
    }
}
