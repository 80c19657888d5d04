//! ByteSteps resilient call pipeline
//!
//! Every ByteSteps serverless function talks to something flaky: an LLM
//! endpoint for coaching, a text-to-speech service, a managed database. This
//! crate is the shared guard rail around those calls. One entry point,
//! [`CallPipeline::call`], runs the whole sequence:
//!
//! 1. **Rate limiter** - sliding-window quota per (identity, endpoint);
//!    denied callers get a distinct "too many requests" error and the
//!    operation is never attempted.
//! 2. **Circuit breaker** - per-dependency failure tracking. After enough
//!    consecutive exhausted sequences the circuit opens and calls are
//!    rejected with a "retry in N seconds" hint until a probe succeeds.
//! 3. **Retry loop** - bounded attempts with exponential backoff and a
//!    per-attempt timeout, so one stalled upstream can't pin a request.
//! 4. **Audit sink** - every attempt's outcome is recorded best-effort,
//!    capped FIFO, for diagnostics and the compliance trail.
//!
//! The breaker wraps the whole retry loop: transient blips are absorbed by
//! retries, and only total exhaustion spends breaker budget.
//!
//! ## Quick example
//!
//! ```no_run
//! use resilience::{CallPipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let pipeline = CallPipeline::new(PipelineConfig::default());
//!
//!     let reply = pipeline
//!         .call("203.0.113.7", "llm-service", |_attempt| async {
//!             // your outbound request here
//!             Ok::<_, String>("coaching response")
//!         })
//!         .await;
//!
//!     match reply {
//!         Ok(text) => println!("{text}"),
//!         Err(err) => eprintln!("{err}"), // distinct messaging per variant
//!     }
//! }
//! ```
//!
//! ## Inbound abuse prevention
//!
//! Request handlers use the same limiter with the fail-closed
//! [`rate_limit::presets::anonymous_abuse`] preset and answer denials with
//! the fixed [`TooManyRequests`] 429 body.
//!
//! State is process-local by design; see the [`pipeline`] module docs for the
//! multi-instance caveat.

pub mod audit;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
mod serde_millis;

pub use crate::audit::{actions, AuditEvent, AuditSink, AuditStore};
pub use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use crate::config::PipelineConfig;
pub use crate::error::{CallError, StoreError};
pub use crate::pipeline::CallPipeline;
pub use crate::rate_limit::{
    client_identity, FailurePolicy, MemoryStore, RateLimitConfig, RateLimitStore, RateLimiter,
    TooManyRequests, UNKNOWN_IDENTITY,
};
pub use crate::retry::{
    execute_with_retry, execute_with_retry_async, is_retryable_error, RetryConfig, RetryResult,
};
