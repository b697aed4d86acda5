//! Bounded exponential backoff for transient collaborator failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Result;

/// How many times to try and how long to wait before the first retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2×base, 4×base, capped at 32×base.
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay * (1u32 << (retry.saturating_sub(1)).min(5))
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are exhausted. The last error is returned.
pub async fn with_backoff<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.delay(attempt);
                warn!(attempt, ?delay, "{what} failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
