//! Backoff for flaky radio operations.
//!
//! Only the platform-facing steps of the BLE transport are retried (adapter
//! scan, connect). Nothing in the session retries: a dropped frame or a
//! rejected write is final.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retry schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each delay by up to 25% at random.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Bands advertise slowly; scans retry quickly and often.
    pub fn for_scan() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// A band busy with another central needs longer to come free.
    pub fn for_connect() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let delay = if self.jitter {
            capped * (1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

/// Whether `error` may clear up on its own.
pub fn is_retryable(error: &Error) -> bool {
    matches!(
        error,
        Error::Bluetooth(_) | Error::Transport { .. } | Error::Timeout { .. }
    )
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// runs out of attempts.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if is_retryable(&e) && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    operation = operation_name,
                    attempt,
                    max = config.max_retries,
                    ?delay,
                    error = %e,
                    "Retrying"
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    #[test]
    fn test_delay_growth_is_capped() {
        let config = RetryConfig::for_connect().jitter(false);
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig::for_scan();
        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(625));
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&Error::transport("connect", "busy")));
        assert!(!is_retryable(&Error::PermissionDenied));
        assert!(!is_retryable(&Error::device_not_found("band")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = with_retry(&RetryConfig::for_connect().jitter(false), "connect", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::transport("connect", "busy"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_on_fatal_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryConfig::default(), "scan", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::PermissionDenied) }
        })
        .await;

        assert!(matches!(result, Err(Error::PermissionDenied)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&RetryConfig::none(), "scan", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::transport("scan", "adapter off")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
