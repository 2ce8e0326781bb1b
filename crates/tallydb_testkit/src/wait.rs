//! Async wait helpers.
//!
//! The upload engine works in the background, so tests poll for the state
//! they expect with a deadline instead of sleeping for a fixed time.

use std::future::Future;
use std::time::Duration;
use tallydb_sync_engine::SyncStatus;
use tokio::sync::watch;

/// Default deadline for waits.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics with `what` if it does not hold within [`WAIT_TIMEOUT`].
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Waits until the published status satisfies `predicate` and returns it.
///
/// # Panics
///
/// Panics with `what` on timeout or if the status channel closes.
pub async fn wait_for_status<F>(
    what: &str,
    status: &mut watch::Receiver<SyncStatus>,
    mut predicate: F,
) -> SyncStatus
where
    F: FnMut(&SyncStatus) -> bool,
{
    let matched = match tokio::time::timeout(WAIT_TIMEOUT, status.wait_for(|s| predicate(s))).await
    {
        Ok(Ok(current)) => Some(current.clone()),
        Ok(Err(_)) => panic!("status channel closed while waiting for {what}"),
        Err(_) => None,
    };
    match matched {
        Some(current) => current,
        None => panic!(
            "timed out waiting for {what}: last status {:?}",
            *status.borrow()
        ),
    }
}

/// Awaits `future` with the default deadline.
///
/// # Panics
///
/// Panics with `what` on timeout.
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    match tokio::time::timeout(WAIT_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// Asserts that `condition` stays false for `period`.
///
/// # Panics
///
/// Panics with `what` as soon as the condition holds.
pub async fn stays_false<F>(what: &str, period: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + period;
    while tokio::time::Instant::now() < deadline {
        assert!(!condition(), "unexpectedly observed {what}");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
