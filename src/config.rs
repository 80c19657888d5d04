use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryConfig;

/// Configuration for a [`CallPipeline`](crate::pipeline::CallPipeline).
///
/// # Example
/// ```
/// use resilience::{CallPipeline, PipelineConfig, RetryConfig};
/// use std::time::Duration;
///
/// let cfg = PipelineConfig::default()
///     .with_retry(RetryConfig::default().with_max_retries(2))
///     .with_attempt_timeout(Some(Duration::from_secs(10)));
///
/// let pipeline = CallPipeline::new(cfg);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retry behavior for each guarded call.
    pub retry: RetryConfig,
    /// Default breaker settings for every dependency in the registry.
    pub breaker: CircuitBreakerConfig,
    /// Sliding-window quota applied per (identity, dependency).
    pub rate_limit: RateLimitConfig,
    /// Abort any single attempt that runs longer than this. `None` disables
    /// the guard, which leaves the breaker unable to catch a stalled call.
    #[serde(with = "crate::serde_millis::opt")]
    pub attempt_timeout: Option<Duration>,
    /// Master switch for the limiter, breaker, and retries. When off, calls
    /// execute exactly once with no gating.
    pub enable_resilience: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            attempt_timeout: Some(Duration::from_secs(30)),
            enable_resilience: true,
        }
    }
}

impl PipelineConfig {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_resilience(mut self, enabled: bool) -> Self {
        self.enable_resilience = enabled;
        self
    }
}
