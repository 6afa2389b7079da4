//! Bounded retry of transient failures.
//!
//! Only errors tagged with [`Retryable`] are retried. Anything else aborts
//! the loop on the spot, without sleeping.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

pub const DEFAULT_ATTEMPTS: u32 = 30;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// Marks the wrapped error as transient.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Retryable(#[from] pub anyhow::Error);

impl Retryable {
    pub fn wrap(err: impl Into<anyhow::Error>) -> anyhow::Error {
        anyhow::Error::new(Retryable(err.into()))
    }
}

pub fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Retryable>().is_some()
}

#[derive(Debug, Clone, Copy)]
pub struct Retrier {
    attempts: u32,
    delay: Duration,
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, DEFAULT_DELAY)
    }
}

impl Retrier {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `action` until it succeeds, fails with an untagged error, or the
    /// attempt budget runs out.
    pub async fn retry<T, F, Fut>(&self, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match action().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) if is_retryable(&err) => {
                    if attempt >= self.attempts {
                        return Err(err.context(format!("Retried '{}' times", self.attempts)));
                    }
                    warn!(attempt, max = self.attempts, error = %err, "Retryable failure");
                    tokio::time::sleep(self.delay).await;
                }
                Err(err) => return Err(err.context("Encountered non-retryable error")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> Retrier {
        Retrier::new(attempts, Duration::ZERO)
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let value = fast(5)
            .retry(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(Retryable::wrap(anyhow!("not ready")))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_exactly_the_attempt_budget() {
        let calls = AtomicU32::new(0);
        let err = fast(4)
            .retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Retryable::wrap(anyhow!("still not ready")))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(err.to_string().contains("Retried '4' times"));
        assert!(format!("{err:#}").contains("still not ready"));
    }

    #[tokio::test]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let err = fast(30)
            .retry(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow!("boom"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(format!("{err:#}").contains("Encountered non-retryable error: boom"));
    }

    #[test]
    fn retryable_tag_survives_context() {
        let err = Retryable::wrap(anyhow!("x")).context("while listing");
        assert!(is_retryable(&err));
        assert!(!is_retryable(&anyhow!("plain")));
    }

    #[test]
    fn default_policy_is_thirty_attempts_two_seconds_apart() {
        let r = Retrier::default();
        assert_eq!(r.attempts(), 30);
        assert_eq!(r.delay, Duration::from_secs(2));
    }
}
