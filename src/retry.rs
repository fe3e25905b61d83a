//! Retry with exponential backoff for transient I/O.
//!
//! Fetches, broker publishes and store writes all go through [`Backoff`].
//! Only errors that report themselves as transient
//! ([`IngestError::is_transient`]) are retried; anything else is returned
//! immediately.
//!
//! # Retry Strategy
//!
//! ```text
//! delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..=max_jitter)
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use rand::{Rng, rng};
use tokio::time::sleep;
use tracing::{error, warn};

use crate::error::{IngestError, Result};

/// Retry policy for transient failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Maximum number of retries after the first attempt.
    max_retries: usize,
    /// Delay before the first retry; doubles with each attempt.
    base_delay: Duration,
    /// Cap on the exponential delay.
    max_delay: Duration,
    /// Upper bound of the random jitter added to every delay.
    max_jitter: Duration,
}

impl Backoff {
    /// Create a policy with a 30 second delay cap and up to 250ms of jitter.
    pub fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Delay before retry number `attempt` (1-based).
    fn delay_for(&self, attempt: usize) -> Duration {
        let shift = attempt.saturating_sub(1).min(31) as u32;
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng().random_range(0..=jitter_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of retries.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let elapsed_ms_attempt = attempt_t0.elapsed().as_millis() as u64;
                    let elapsed_ms_total = total_t0.elapsed().as_millis() as u64;

                    if attempt > self.max_retries {
                        error!(
                            what,
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt,
                            elapsed_ms_total,
                            error = %e,
                            "exhausted retries"
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        what,
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt,
                        elapsed_ms_total,
                        ?delay,
                        error = %e,
                        "attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Bound `fut` by `limit`; running out of time is a transient failure.
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| IngestError::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick(max_retries: usize) -> Backoff {
        Backoff::new(max_retries, Duration::from_millis(1)).with_jitter(Duration::ZERO)
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff::new(5, Duration::from_secs(1))
            .with_jitter(Duration::ZERO)
            .with_max_delay(Duration::from_secs(5));
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = quick(3)
            .retry("flaky", || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(IngestError::Broker("unavailable".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = quick(2)
            .retry("down", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(IngestError::Timeout(Duration::from_millis(5)))
                }
            })
            .await;
        assert!(matches!(result, Err(IngestError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = quick(5)
            .retry("bad input", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(IngestError::UnsupportedSource("x".to_string()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transient_error() {
        let result: Result<()> = with_timeout(Duration::from_millis(5), async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(err, IngestError::Timeout(_)));
        assert!(err.is_transient());
    }
}
