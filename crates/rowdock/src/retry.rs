//! Retry policy with exponential backoff
//!
//! Retry eligibility comes from the dialect's error classification; only
//! failures carrying a driver code the dialect calls retryable are
//! attempted again.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetrySettings;
use crate::dialect::DialectAdapter;
use crate::error::{Error, ErrorClass};

/// Attempt limit and backoff schedule
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Cap for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            multiplier: settings.multiplier.max(1.0),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

/// Failure after the policy gave up
#[derive(Debug)]
pub struct RetryFailure {
    /// Last error
    pub error: Error,
    /// Attempts made, including the failed last one
    pub attempts: u32,
    /// Classification of the last error
    pub class: ErrorClass,
}

impl RetryPolicy {
    /// Set the attempt limit
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set base and maximum delay
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Delay before retry number `retry` (1-based): `base * multiplier^(retry-1)`, capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1).min(i32::MAX as u32) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        if millis.is_finite() && millis > 0.0 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Classify an error through the dialect. Errors without a driver code
    /// (connection loss, invalid SQL built locally) are fatal.
    pub fn classify(dialect: &dyn DialectAdapter, error: &Error) -> ErrorClass {
        error
            .driver_code()
            .map(|code| dialect.classify_error(code))
            .unwrap_or(ErrorClass::Fatal)
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt limit is
    /// reached. Returns the value and the number of attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        dialect: &dyn DialectAdapter,
        operation: &str,
        mut op: F,
    ) -> std::result::Result<(T, u32), RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = crate::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(error) => {
                    let class = Self::classify(dialect, &error);
                    if !class.is_retryable() || attempt >= self.max_attempts {
                        return Err(RetryFailure {
                            error,
                            attempts: attempt,
                            class,
                        });
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retryable failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::MySqlDialect;
    use crate::error::DriverCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(attempts)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_from_settings() {
        let settings = RetrySettings {
            max_attempts: 3,
            base_delay_ms: 10,
            multiplier: 1.5,
            max_delay_ms: 50,
            retry_commit: false,
        };
        let policy = RetryPolicy::from(&settings);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff(2), Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(5)
            .run(&MySqlDialect, "flush", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(Error::query_with_code("deadlock", DriverCode::vendor(1213)))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, (3, 3));
    }

    #[tokio::test]
    async fn test_run_stops_on_fatal() {
        let failure = fast(5)
            .run(&MySqlDialect, "flush", |_| async {
                Err::<(), _>(Error::query_with_code("dup", DriverCode::vendor(1062)))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.class, ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_run_exhausts_attempts() {
        let failure = fast(2)
            .run(&MySqlDialect, "flush", |_| async {
                Err::<(), _>(Error::query_with_code("lock wait", DriverCode::vendor(1205)))
            })
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert!(failure.class.is_retryable());
    }
}
