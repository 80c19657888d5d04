//! Orchestration of the guarded call path.
//!
//! One [`CallPipeline::call`] runs the full gauntlet for every outbound
//! dependency call: rate-limit check, circuit-breaker gate, then the retry
//! loop with per-attempt timeouts, auditing each attempt along the way.
//!
//! The breaker sits outside the retry loop on purpose: a transient blip is
//! absorbed by retries, and only a fully exhausted sequence counts against the
//! breaker's failure budget.
//!
//! All state (breakers, rate-limit records, audit ring) lives inside the
//! pipeline value rather than in globals, so each deployed instance (or test)
//! owns its own. Across a fleet of stateless instances the effective failure
//! threshold is therefore `threshold x instance_count`; that is an accepted
//! limitation of process-local state, not a bug.

use serde_json::json;
use std::future::Future;
use std::sync::Arc;

use crate::audit::{actions, AuditSink};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::PipelineConfig;
use crate::error::CallError;
use crate::rate_limit::RateLimiter;
use crate::retry::{execute_with_retry_async, RetryResult};

/// Resilient wrapper around outbound dependency calls.
pub struct CallPipeline {
    config: PipelineConfig,
    breakers: CircuitBreakerRegistry,
    limiter: RateLimiter,
    audit: Arc<AuditSink>,
}

impl CallPipeline {
    /// Pipeline with a fresh in-memory limiter store and audit ring.
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_audit(config, Arc::new(AuditSink::default()))
    }

    /// Pipeline sharing an existing audit sink (e.g. the application-wide
    /// compliance log).
    pub fn with_audit(config: PipelineConfig, audit: Arc<AuditSink>) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(config.breaker),
            limiter: RateLimiter::new(config.rate_limit),
            config,
            audit,
        }
    }

    /// Fully explicit construction, for custom limiter stores.
    pub fn with_parts(
        config: PipelineConfig,
        limiter: RateLimiter,
        breakers: CircuitBreakerRegistry,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            config,
            breakers,
            limiter,
            audit,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditSink> {
        &self.audit
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Invoke `operation` against the named dependency with full guarding.
    ///
    /// `identity` is the caller (IP or user id) charged against the rate
    /// limit; `dependency` doubles as the rate-limit endpoint, the breaker
    /// name, and the operation name in audit records. The closure receives
    /// the zero-based attempt number and returns the attempt's future.
    ///
    /// Outcomes:
    /// - `Ok(value)` - some attempt succeeded (audited as `api_success`).
    /// - [`CallError::RateLimited`] - denied before any attempt; no breaker
    ///   or audit effect.
    /// - [`CallError::CircuitOpen`] - breaker rejected the call; the error
    ///   carries the remaining cooldown.
    /// - [`CallError::Exhausted`] - every attempt failed (each audited as
    ///   `api_error`); counted once against the breaker.
    pub async fn call<T, F, Fut>(
        &self,
        identity: &str,
        dependency: &str,
        operation: F,
    ) -> Result<T, CallError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        self.call_with_error_hook(identity, dependency, operation, |_| {})
            .await
    }

    /// [`call`](Self::call) with a hook invoked once with the final error
    /// message when every attempt has failed, before the error is returned.
    /// Lets call sites surface user-facing messaging or cleanup without
    /// unpacking the result first.
    pub async fn call_with_error_hook<T, F, Fut, H>(
        &self,
        identity: &str,
        dependency: &str,
        mut operation: F,
        on_exhausted: H,
    ) -> Result<T, CallError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, String>>,
        H: FnOnce(&str),
    {
        let resilience = self.config.enable_resilience;

        if resilience && !self.limiter.allow(identity, dependency) {
            return Err(CallError::RateLimited {
                endpoint: dependency.to_string(),
            });
        }

        let breaker = self.breakers.get_or_create(dependency);
        if resilience {
            if let Err(retry_in) = breaker.check() {
                return Err(CallError::CircuitOpen {
                    dependency: dependency.to_string(),
                    retry_in,
                });
            }
        }

        let retry_cfg = if resilience {
            self.config.retry
        } else {
            self.config.retry.with_max_retries(0)
        };
        let attempt_timeout = self.config.attempt_timeout;
        let audit = &self.audit;

        let outcome = execute_with_retry_async(&retry_cfg, |attempt| {
            let fut = operation(attempt);
            async move {
                if attempt > 0 {
                    tracing::debug!(dependency, attempt, "retrying guarded call");
                }

                let result = match attempt_timeout {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(inner) => inner,
                        Err(_) => Err(format!(
                            "attempt timed out after {}ms",
                            limit.as_millis()
                        )),
                    },
                    None => fut.await,
                };

                match result {
                    Ok(value) => {
                        audit.record(
                            actions::API_SUCCESS,
                            json!({ "operation": dependency, "attempt": attempt + 1 }),
                        );
                        Ok(value)
                    }
                    Err(error) => {
                        audit.record(
                            actions::API_ERROR,
                            json!({
                                "operation": dependency,
                                "attempt": attempt + 1,
                                "error": error,
                            }),
                        );
                        Err(error)
                    }
                }
            }
        })
        .await;

        let RetryResult {
            result, attempts, ..
        } = outcome;

        match result {
            Ok(value) => {
                if resilience {
                    breaker.record_success();
                }
                Ok(value)
            }
            Err(message) => {
                if resilience && breaker.record_failure() {
                    // Best-effort by construction: AuditSink::record never
                    // fails outward, so a dead audit path cannot break the
                    // breaker.
                    self.audit.record(
                        actions::CIRCUIT_BREAKER_OPENED,
                        json!({
                            "dependency": dependency,
                            "failures": breaker.failure_count(),
                            "error": message,
                        }),
                    );
                    tracing::warn!(dependency, "circuit breaker opened");
                }
                on_exhausted(&message);
                Err(CallError::Exhausted {
                    operation: dependency.to_string(),
                    attempts,
                    message,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::rate_limit::RateLimitConfig;
    use crate::retry::RetryConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_retry(
                RetryConfig::default()
                    .with_max_retries(2)
                    .with_base_delay(std::time::Duration::from_millis(1))
                    .with_jitter(false),
            )
            .with_attempt_timeout(None)
    }

    #[tokio::test]
    async fn rate_limited_call_is_never_attempted() {
        let pipeline = CallPipeline::new(
            quick_config().with_rate_limit(RateLimitConfig::default().with_max_requests(1)),
        );
        let invocations = AtomicU32::new(0);

        let first: Result<&str, _> = pipeline
            .call("1.2.3.4", "llm-service", |_| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Ok("ok") }
            })
            .await;
        assert!(first.is_ok());

        let second: Result<&str, _> = pipeline
            .call("1.2.3.4", "llm-service", |_| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Ok("ok") }
            })
            .await;

        assert!(matches!(second, Err(CallError::RateLimited { .. })));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        // Breaker untouched by the rejection.
        assert_eq!(
            pipeline.breakers().get_or_create("llm-service").failure_count(),
            0
        );
    }

    #[tokio::test]
    async fn exhausted_sequence_counts_once_against_the_breaker() {
        let pipeline = CallPipeline::new(quick_config());

        let result: Result<(), _> = pipeline
            .call("ip", "tts", |_| async { Err("HTTP 503".to_string()) })
            .await;

        match result {
            Err(CallError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        // Three attempts, one failure-budget increment.
        assert_eq!(pipeline.breakers().get_or_create("tts").failure_count(), 1);
    }

    #[tokio::test]
    async fn error_hook_fires_with_the_final_error_message() {
        let pipeline = CallPipeline::new(quick_config());
        let seen = std::sync::Mutex::new(None);

        let result: Result<(), _> = pipeline
            .call_with_error_hook(
                "ip",
                "llm-service",
                |_| async { Err("HTTP 503".to_string()) },
                |message| {
                    *seen.lock().unwrap() = Some(message.to_string());
                },
            )
            .await;

        assert!(result.is_err());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("HTTP 503"));
    }

    #[tokio::test]
    async fn disabled_resilience_runs_exactly_once_without_gating() {
        let pipeline = CallPipeline::new(
            quick_config()
                .with_resilience(false)
                .with_rate_limit(RateLimitConfig::default().with_max_requests(0)),
        );
        let invocations = AtomicU32::new(0);

        let result: Result<(), _> = pipeline
            .call("ip", "llm-service", |_| {
                invocations.fetch_add(1, Ordering::SeqCst);
                async { Err("HTTP 503".to_string()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(CallError::Exhausted { attempts: 1, .. })
        ));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(
            pipeline.breakers().get_or_create("llm-service").current_state(),
            CircuitState::Closed
        );
    }
}
