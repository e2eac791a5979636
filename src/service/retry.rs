//! Bounded retry with linear backoff for transient persistence failures.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::store::{LockManager, StoreError};

/// Run `op` up to `attempts` times, sleeping `backoff_base * n` between the
/// n-th failure and the next try. Only transient errors are retried;
/// precondition and integrity errors surface immediately.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    backoff_base: Duration,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;
    let mut delay = backoff_base;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    operation = what,
                    attempt,
                    error = %e,
                    "Transient store failure, backing off"
                );
                tokio::time::sleep(delay).await;
                delay += backoff_base;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Try to take a named lock, backing off between attempts. `Ok(false)` means
/// every attempt found the lock held elsewhere.
pub async fn acquire_with_backoff(
    locks: &dyn LockManager,
    name: &str,
    attempts: u32,
    backoff_base: Duration,
) -> Result<bool, StoreError> {
    let mut attempt = 0u32;
    let mut delay = backoff_base;
    loop {
        attempt += 1;
        if locks.acquire(name).await? {
            return Ok(true);
        }
        if attempt >= attempts {
            return Ok(false);
        }
        tokio::time::sleep(delay).await;
        delay += backoff_base;
    }
}
