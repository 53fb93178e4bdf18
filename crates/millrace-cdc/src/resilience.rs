//! Retry primitives for transient database failures.
//!
//! Workers heal retryable errors locally: exponential backoff between
//! attempts, a hard attempt cap, and immediate propagation of fatal kinds.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Exponential backoff with jitterless doubling, capped at `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; doubles each call.
    pub fn next_backoff(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Retry policy applied around every collaborator call in the readers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 0 means fail immediately.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration, backoff_max: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            backoff_max,
        }
    }

    /// Run `op`, retrying retryable failures up to the cap. Fatal errors
    /// and exhausted retries propagate.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = ExponentialBackoff::new(self.backoff_base, self.backoff_max);
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() && backoff.attempt() < self.max_retries => {
                    let delay = backoff.next_backoff();
                    debug!(
                        operation = what,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    if err.is_retriable() {
                        warn!(operation = what, retries = self.max_retries, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CdcError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut b = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_backoff(), Duration::from_millis(100));
        assert_eq!(b.next_backoff(), Duration::from_millis(200));
        assert_eq!(b.next_backoff(), Duration::from_millis(350));
        assert_eq!(b.next_backoff(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_backoff(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_retry_heals_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let result = policy
            .run("probe", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CdcError::transient("reset"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_cap() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2));
        let result: Result<()> = policy
            .run("probe", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(CdcError::timeout("scan")) }
            })
            .await;
        assert!(result.is_err());
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_do_not_retry() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let result: Result<()> = policy
            .run("probe", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(CdcError::config("bad")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
