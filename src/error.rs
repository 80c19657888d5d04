use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a guarded call.
///
/// The three variants are deliberately distinct so calling code can show
/// different messaging: "wait before retrying" for [`CallError::RateLimited`],
/// "temporarily unavailable" for [`CallError::CircuitOpen`], and a terminal
/// failure for [`CallError::Exhausted`]. A guarded call never returns a bare
/// null or sentinel; it is either a success value or one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The caller exceeded its sliding-window quota. The operation was never
    /// attempted, so this does not count against any circuit breaker.
    #[error("Too many requests for '{endpoint}'. Please try again later.")]
    RateLimited {
        /// Logical endpoint name the quota applies to.
        endpoint: String,
    },

    /// The dependency's circuit is open. The operation was never attempted.
    #[error("Service temporarily unavailable. Retry in {} seconds.", secs_ceil(.retry_in))]
    CircuitOpen {
        /// Named dependency whose breaker rejected the call.
        dependency: String,
        /// Remaining cooldown before the breaker will allow a probe.
        retry_in: Duration,
    },

    /// Every allowed attempt failed. Counted once against the dependency's
    /// circuit breaker, regardless of how many attempts were made.
    #[error("'{operation}' failed after {attempts} attempt(s): {message}")]
    Exhausted {
        /// Operation name used in audit logs.
        operation: String,
        /// Total attempts made (1 = no retries happened).
        attempts: u32,
        /// Message from the final failed attempt.
        message: String,
    },
}

impl CallError {
    /// True when the caller should present a "try again later" style message
    /// rather than a hard failure.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            CallError::RateLimited { .. } | CallError::CircuitOpen { .. }
        )
    }
}

/// Rounded-up whole seconds, so "Retry in 0 seconds" never appears while any
/// cooldown remains.
fn secs_ceil(d: &Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

/// A persistence backend (rate-limit table, remote audit log) was unreachable
/// or rejected the write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("store unavailable: {0}")]
pub struct StoreError(pub String);
