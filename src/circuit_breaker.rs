//! Circuit breaker per named dependency.
//!
//! After `failure_threshold` consecutive exhausted call sequences, the breaker
//! opens and rejects calls outright until `reset_timeout` has passed. The
//! first call after the cooldown goes through as a single probe (half-open);
//! its outcome decides whether the circuit closes again or the cooldown
//! restarts. Each named dependency owns an independent breaker, so a broken
//! LLM endpoint never blocks text-to-speech.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before a probe call is allowed through.
    #[serde(with = "crate::serde_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, calls pass through.
    Closed,
    /// Calls rejected immediately.
    Open,
    /// One probe call in flight to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Set on every transition into Open; the cooldown is measured from here.
    opened_at: Option<Instant>,
    /// True while the half-open probe is outstanding.
    probe_in_flight: bool,
    last_change: Instant,
}

/// Circuit breaker for one named dependency.
///
/// State updates happen under a single mutex, so interleaved failures from
/// concurrent requests cannot lose increments or observe a torn transition.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    total_successes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_change: Instant::now(),
            }),
            total_successes: AtomicU64::new(0),
        }
    }

    /// Gate a call. `Ok(())` means the call may proceed (and, in half-open,
    /// that this call is the probe); `Err(remaining)` carries the cooldown
    /// left before the breaker will allow another attempt.
    pub fn check(&self) -> Result<(), Duration> {
        self.check_at(Instant::now())
    }

    /// [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, now: Instant) -> Result<(), Duration> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed > self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    inner.last_change = now;
                    Ok(())
                } else {
                    Err(self.config.reset_timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                let since_change = now.saturating_duration_since(inner.last_change);
                if inner.probe_in_flight && since_change <= self.config.reset_timeout {
                    // Only one probe at a time; later callers wait out the
                    // probe rather than stampeding a recovering service.
                    Err(self.config.reset_timeout - since_change)
                } else {
                    // Either no probe is outstanding, or the outstanding one
                    // has been silent for a full reset_timeout. A dropped
                    // call future never reports an outcome, so an admitted
                    // probe that old is reclaimed instead of wedging the
                    // breaker shut against a healthy dependency.
                    inner.probe_in_flight = true;
                    inner.last_change = now;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call sequence.
    pub fn record_success(&self) {
        self.record_success_at(Instant::now());
    }

    pub fn record_success_at(&self, now: Instant) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.probe_in_flight = false;
                inner.opened_at = None;
                inner.last_change = now;
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed (fully exhausted) call sequence. Returns true exactly
    /// when this failure transitioned the breaker into Open, so the owner can
    /// emit a `circuit_breaker_opened` audit event.
    pub fn record_failure(&self) -> bool {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.last_change = now;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                // Probe failed: reopen and restart the cooldown.
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                inner.last_change = now;
                true
            }
            CircuitState::Open => false,
        }
    }

    /// Force the breaker back to Closed with a clean failure count. Meant for
    /// operational recovery (admin/debug action), not the normal lifecycle.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        inner.opened_at = None;
        inner.last_change = Instant::now();
    }

    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Consecutive failures since the last success or reset.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }

    /// Total successes over the breaker's lifetime.
    pub fn success_count(&self) -> u64 {
        self.total_successes.load(Ordering::Relaxed)
    }
}

/// Registry of breakers, one per named dependency.
///
/// Owned by the orchestration layer and passed by handle, rather than living
/// in module-level statics, so tests and multi-tenant setups get isolated
/// state.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Get or lazily create the breaker for a dependency.
    pub fn get_or_create(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.default_config)))
            .clone()
    }

    /// Get or create with a per-dependency config override.
    pub fn get_or_create_with_config(
        &self,
        dependency: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config)))
            .clone()
    }

    /// (dependency, state, consecutive failures) for every known breaker.
    pub fn all_stats(&self) -> Vec<(String, CircuitState, u32)> {
        self.breakers
            .iter()
            .map(|entry| {
                let (name, cb) = entry.pair();
                (name.clone(), cb.current_state(), cb.failure_count())
            })
            .collect()
    }

    /// Manually reset one dependency's breaker, if it exists.
    pub fn reset(&self, dependency: &str) {
        if let Some(cb) = self.breakers.get(dependency) {
            cb.reset();
        }
    }

    /// Manually reset every breaker in place.
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    /// True unless the dependency's circuit is currently open or probing.
    pub fn is_healthy(&self, dependency: &str) -> bool {
        self.breakers
            .get(dependency)
            .map(|cb| cb.current_state() == CircuitState::Closed)
            .unwrap_or(true)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn starts_closed_and_allows() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn stays_closed_below_threshold() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(5));
        for _ in 0..4 {
            assert!(!cb.record_failure());
        }
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn opens_at_threshold_and_reports_the_transition() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(5));
        for _ in 0..4 {
            assert!(!cb.record_failure());
        }
        assert!(cb.record_failure());
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(cb.check().is_err());
        // Already open: further failures are not a fresh transition.
        assert!(!cb.record_failure());
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(3));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.record_failure());
        assert_eq!(cb.current_state(), CircuitState::Open);
    }

    #[test]
    fn open_rejection_carries_remaining_cooldown() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_reset_timeout(Duration::from_millis(60_000)),
        );
        let base = Instant::now();

        for ms in [0, 1, 2] {
            cb.record_failure_at(at(base, ms));
        }
        assert_eq!(cb.current_state(), CircuitState::Open);

        let remaining = cb.check_at(at(base, 30_000)).unwrap_err();
        // Opened at t=2ms, so 29_998ms of the 60s cooldown has elapsed.
        assert_eq!(remaining, Duration::from_millis(30_002));
    }

    #[test]
    fn cooldown_expiry_allows_a_single_probe() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(60_000)),
        );
        let base = Instant::now();
        cb.record_failure_at(at(base, 0));

        // Still cooling down.
        assert!(cb.check_at(at(base, 60_000)).is_err());

        // Past the cooldown: this call becomes the probe.
        assert!(cb.check_at(at(base, 65_000)).is_ok());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        // A second caller while the probe is out is rejected.
        assert!(cb.check_at(at(base, 65_001)).is_err());
    }

    #[test]
    fn abandoned_half_open_call_is_reclaimed() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(100)),
        );
        let base = Instant::now();
        cb.record_failure_at(at(base, 0));

        // Cooldown elapsed: this caller is admitted but never reports an
        // outcome (dropped future, client disconnect, ...).
        assert!(cb.check_at(at(base, 150)).is_ok());

        // While the admitted call could still report, other callers wait.
        assert!(cb.check_at(at(base, 200)).is_err());

        // Silent for a full reset_timeout: a fresh caller is admitted
        // rather than being rejected forever.
        assert!(cb.check_at(at(base, 251)).is_ok());
        cb.record_success_at(at(base, 260));
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.check_at(at(base, 261)).is_ok());
    }

    #[test]
    fn probe_success_closes_the_circuit() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(100)),
        );
        let base = Instant::now();
        cb.record_failure_at(at(base, 0));
        assert!(cb.check_at(at(base, 150)).is_ok());

        cb.record_success_at(at(base, 160));
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.check_at(at(base, 161)).is_ok());
    }

    #[test]
    fn probe_failure_reopens_and_restarts_cooldown() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(100)),
        );
        let base = Instant::now();
        cb.record_failure_at(at(base, 0));
        assert!(cb.check_at(at(base, 150)).is_ok());

        assert!(cb.record_failure_at(at(base, 160)));
        assert_eq!(cb.current_state(), CircuitState::Open);

        // Cooldown restarted at t=160: t=200 is still inside it.
        assert!(cb.check_at(at(base, 200)).is_err());
        assert!(cb.check_at(at(base, 261)).is_ok());
    }

    #[test]
    fn manual_reset_forces_closed() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default().with_failure_threshold(1));
        cb.record_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn registry_isolates_dependencies() {
        let registry = CircuitBreakerRegistry::default();
        let llm = registry.get_or_create("llm-service");
        let tts = registry.get_or_create("tts");

        for _ in 0..5 {
            llm.record_failure();
        }
        assert_eq!(llm.current_state(), CircuitState::Open);
        assert_eq!(tts.current_state(), CircuitState::Closed);
        assert!(!registry.is_healthy("llm-service"));
        assert!(registry.is_healthy("tts"));
        assert!(registry.is_healthy("never-seen"));
    }

    #[test]
    fn registry_reset_all_closes_breakers_in_place() {
        let registry = CircuitBreakerRegistry::default();
        let llm = registry.get_or_create("llm-service");
        for _ in 0..5 {
            llm.record_failure();
        }
        registry.reset_all();

        // Same instance, now closed.
        assert_eq!(llm.current_state(), CircuitState::Closed);
        assert_eq!(registry.all_stats().len(), 1);
    }
}
