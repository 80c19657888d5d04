//! Bounded retries with exponential backoff.
//!
//! Transient failures (network hiccups, upstream 5xx) get absorbed here;
//! only a fully exhausted sequence is surfaced to the caller. Attempts are
//! strictly sequential and the backoff between them doubles each time, capped
//! at `max_delay` so a misconfigured base can never stall a request for
//! minutes.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt, so `max_retries + 1` tries total.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    #[serde(with = "crate::serde_millis")]
    pub base_delay: Duration,
    /// Ceiling on any single backoff delay.
    #[serde(with = "crate::serde_millis")]
    pub max_delay: Duration,
    /// Add 0-50% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Outcome of a retried operation.
#[derive(Debug, Clone)]
pub struct RetryResult<T> {
    /// Final result: the first success, or the last error seen.
    pub result: Result<T, String>,
    /// Attempts actually made (1 = succeeded or aborted first try).
    pub attempts: u32,
    /// Wall time across all attempts including backoff sleeps.
    pub total_duration: Duration,
    /// Whether the operation ultimately succeeded.
    pub succeeded: bool,
}

impl<T> RetryResult<T> {
    pub fn into_result(self) -> Result<T, String> {
        self.result
    }
}

/// Run `operation` until it succeeds, permanently fails, or retries run out.
///
/// The closure receives the zero-based attempt number. Errors classified as
/// non-retryable by [`is_retryable_error`] abort the loop immediately rather
/// than burning the remaining attempts on, say, a bad API key.
///
/// Blocking variant (`thread::sleep` between attempts); use
/// [`execute_with_retry_async`] inside a runtime.
pub fn execute_with_retry<T, F>(config: &RetryConfig, mut operation: F) -> RetryResult<T>
where
    F: FnMut(u32) -> Result<T, String>,
{
    let started = Instant::now();

    for attempt in 0..=config.max_retries {
        match operation(attempt) {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_duration: started.elapsed(),
                    succeeded: true,
                };
            }
            Err(error) => {
                if !is_retryable_error(&error) || attempt == config.max_retries {
                    return RetryResult {
                        result: Err(error),
                        attempts: attempt + 1,
                        total_duration: started.elapsed(),
                        succeeded: false,
                    };
                }
                std::thread::sleep(backoff_delay(config, attempt));
            }
        }
    }

    // max_retries + 1 iterations always return from inside the loop.
    unreachable!("retry loop exited without a result")
}

/// Async flavor of [`execute_with_retry`]; backoff is a non-blocking
/// `tokio::time::sleep`.
pub async fn execute_with_retry_async<T, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
) -> RetryResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let started = Instant::now();

    for attempt in 0..=config.max_retries {
        match operation(attempt).await {
            Ok(value) => {
                return RetryResult {
                    result: Ok(value),
                    attempts: attempt + 1,
                    total_duration: started.elapsed(),
                    succeeded: true,
                };
            }
            Err(error) => {
                if !is_retryable_error(&error) || attempt == config.max_retries {
                    return RetryResult {
                        result: Err(error),
                        attempts: attempt + 1,
                        total_duration: started.elapsed(),
                        succeeded: false,
                    };
                }
                tokio::time::sleep(backoff_delay(config, attempt)).await;
            }
        }
    }

    unreachable!("retry loop exited without a result")
}

/// Delay before the retry following zero-based `attempt`:
/// `base * 2^attempt`, capped at `max_delay`, plus optional jitter.
pub(crate) fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped = exponential.min(config.max_delay.as_millis() as u64);

    if config.jitter {
        Duration::from_millis(capped + fastrand::u64(0..=capped / 2))
    } else {
        Duration::from_millis(capped)
    }
}

/// Transient-vs-permanent error classification.
///
/// Timeouts, connection drops, and overload statuses (429/502/503/504/408)
/// are worth retrying; auth and client errors (400/401/403/404) are not.
/// Unknown errors default to retryable.
pub fn is_retryable_error(error: &str) -> bool {
    let error = error.to_lowercase();

    if error.contains("timeout")
        || error.contains("timed out")
        || error.contains("connection")
        || error.contains("reset")
        || error.contains("temporarily")
        || error.contains("unavailable")
        || error.contains("429")
        || error.contains("502")
        || error.contains("503")
        || error.contains("504")
        || error.contains("408")
    {
        return true;
    }

    if error.contains("400")
        || error.contains("401")
        || error.contains("403")
        || error.contains("404")
        || error.contains("invalid")
        || error.contains("not found")
    {
        return false;
    }

    true
}
