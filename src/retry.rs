//! Retry with exponential backoff and jitter.
//!
//! Used for one-shot calls that can fail transiently outside the status
//! poller: bucket creation, kube client construction, tool downloads.
//!
//! # Example
//!
//! ```ignore
//! use eks_harness::retry::{retry_with_backoff, RetryConfig};
//!
//! let bucket = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "create_bucket",
//!     || async { s3.create_bucket(&name, &region).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff policy for transiently failing operations.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Fixed delay between attempts, no growth
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }
}

/// Run `operation` until it succeeds or `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(config, operation_name, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but only errors accepted by `should_retry`
/// are retried; anything else is returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&err) {
            warn!(operation = %operation_name, error = %err, "non-retryable failure");
            return Err(err);
        }
        if config.max_attempts > 0 && attempt >= config.max_attempts {
            error!(
                operation = %operation_name,
                attempt,
                error = %err,
                "operation failed after max retries"
            );
            return Err(err);
        }

        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
        warn!(
            operation = %operation_name,
            attempt,
            error = %err,
            delay_ms = jittered.as_millis() as u64,
            "operation failed, retrying"
        );
        tokio::time::sleep(jittered).await;

        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_with_backoff(&fast(3), "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(5), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("throttled")
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(3), "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<(), String> = retry_if(
            &fast(10),
            "create_bucket",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("AccessDenied".to_string())
                }
            },
            |e| e.contains("Throttl"),
        )
        .await;

        assert_eq!(result, Err("AccessDenied".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
