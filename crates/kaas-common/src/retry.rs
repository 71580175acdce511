//! Exponential backoff with jitter.
//!
//! Two consumers share the same curve: the task engine, which persists the
//! next attempt time instead of sleeping, and short in-process retries around
//! individual API calls (`retry_with_backoff`), which only retry errors the
//! [`Error`](crate::Error) taxonomy marks retryable.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Backoff curve and attempt budget
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default curve with a specific attempt budget
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Un-jittered delay after `failed_attempts` failures (1-based)
    ///
    /// `initial_delay * multiplier^(failed_attempts - 1)`, capped at `max_delay`.
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay (0.5x to 1.5x of the base delay, still capped)
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let base = self.base_delay(failed_attempts);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64((base.as_secs_f64() * jitter).min(self.max_delay.as_secs_f64()))
    }

    /// Whether another attempt is allowed after `failed_attempts` failures
    pub fn allows_another(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Stops early on errors that are not retryable. Returns the last error once
/// `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if !config.allows_another(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
