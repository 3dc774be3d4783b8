//! Exponential backoff shared by bus redelivery and in-handler retries.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Exponential backoff: `min * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.min
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Run `op` up to `max_attempts` times, sleeping with `backoff` in between.
/// Returns the last error if every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(
    what: &str,
    max_attempts: u32,
    backoff: Backoff,
    op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_when(what, max_attempts, backoff, |_| true, op).await
}

/// Like [`retry_with_backoff`], but gives up at once on errors for which
/// `retryable` returns false.
pub async fn retry_with_backoff_when<T, E, F, Fut, R>(
    what: &str,
    max_attempts: u32,
    backoff: Backoff,
    retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= max_attempts || !retryable(&e) => return Err(e),
            Err(e) => {
                let delay = backoff.delay_for(attempt);
                warn!(what, attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
