//! Retry with bounded exponential backoff for durable-store writes
//!
//! ```text
//! backoff = min(initial_backoff * multiplier^attempt, max_backoff)
//! ```
//!
//! Only transient storage errors (and per-attempt timeouts) are retried;
//! anything else is returned on the first failure.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use rollup_common::config::RetryConfig;
use rollup_common::error::{Error, StorageError};
use rollup_common::metrics;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound on a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            backoff_multiplier: config.backoff_multiplier,
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed)
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap,
        clippy::cast_precision_loss
    )]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let max_ms = self.max_backoff.as_millis() as f64;
        Duration::from_millis(backoff_ms.min(max_ms) as u64)
    }
}

/// Failure after one or more attempts
#[derive(Debug)]
pub struct RetryError {
    pub attempts: u32,
    pub error: Error,
}

impl RetryError {
    /// Whether the attempts ran out on a transient error
    pub fn exhausted(&self) -> bool {
        self.error.is_transient()
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = rollup_common::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;

        let error = match timeout(policy.attempt_timeout, op()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", operation, attempt);
                }
                return Ok(value);
            }
            Ok(Err(e)) => e,
            Err(_) => Error::Storage(StorageError::Timeout(
                u64::try_from(policy.attempt_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };

        if !error.is_transient() || attempt >= policy.max_attempts {
            return Err(RetryError {
                attempts: attempt,
                error,
            });
        }

        let delay = policy.backoff(attempt - 1);
        warn!(
            "{} failed (attempt {}/{}): {}; retrying in {:?}",
            operation, attempt, policy.max_attempts, error, delay
        );
        metrics::record_storage_retry(operation);
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(300),
            ..fast_policy(5)
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(50));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(30), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast_policy(5), "put", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Storage(StorageError::WriteFailed("busy".into())))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_policy(3), "put", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Storage(StorageError::Unavailable("down".into())))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_policy(5), "get", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Storage(StorageError::CorruptData("bad".into())))
        })
        .await;

        assert!(!result.unwrap_err().exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_attempts_time_out() {
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(10),
            ..fast_policy(2)
        };
        let result: Result<(), _> = retry_with_backoff(&policy, "put", || async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(matches!(err.error, Error::Storage(StorageError::Timeout(10))));
    }
}
