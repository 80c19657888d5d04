//! Sliding-window rate limiting per (identity, endpoint) pair.
//!
//! Each allowed attempt appends a timestamped record; a request is denied when
//! the window already holds `max_requests` records. Denials leave no trace, so
//! a rejected caller does not push its own quota further out.
//!
//! The record store is pluggable: the in-memory [`MemoryStore`] fits a single
//! process, while multi-instance deployments can back the same trait with a
//! shared table. Store failures follow a per-config [`FailurePolicy`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::StoreError;

/// Sentinel identity used when no client address could be resolved
/// (e.g. missing `x-forwarded-for` / `x-real-ip` headers).
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// What to do when the record store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Allow the call. Used for ordinary endpoints, where denying legitimate
    /// users over an infrastructure blip is worse than briefly losing
    /// enforcement.
    FailOpen,
    /// Deny the call. Used for the anonymous-abuse limiter, whose whole job
    /// is enforcement.
    FailClosed,
}

/// Configuration for one sliding-window quota.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum allowed attempts inside any rolling window.
    pub max_requests: u32,
    /// Window length.
    #[serde(with = "crate::serde_millis")]
    pub window: Duration,
    /// Behavior when the record store errors.
    pub policy: FailurePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60),
            policy: FailurePolicy::FailOpen,
        }
    }
}

impl RateLimitConfig {
    pub fn with_max_requests(mut self, max: u32) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Persistence for observed attempts.
///
/// `window_start` of `None` means the window reaches back past every record
/// (only possible very early in process or fleet lifetime).
pub trait RateLimitStore: Send + Sync {
    /// Count records for (identity, endpoint) strictly after `window_start`.
    /// A record at exactly `window_start` is outside the window.
    fn count_since(
        &self,
        identity: &str,
        endpoint: &str,
        window_start: Option<Instant>,
    ) -> Result<u32, StoreError>;

    /// Append one attempt record.
    fn record(&self, identity: &str, endpoint: &str, at: Instant) -> Result<(), StoreError>;
}

/// In-memory record store for single-process deployments.
///
/// Expired records are pruned lazily whenever a key is touched, so storage for
/// an (identity, endpoint) pair stays bounded by its own quota.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<(String, String), Vec<Instant>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryStore {
    fn count_since(
        &self,
        identity: &str,
        endpoint: &str,
        window_start: Option<Instant>,
    ) -> Result<u32, StoreError> {
        let key = (identity.to_string(), endpoint.to_string());
        let Some(mut entry) = self.entries.get_mut(&key) else {
            return Ok(0);
        };
        if let Some(start) = window_start {
            entry.retain(|ts| *ts > start);
        }
        Ok(entry.len() as u32)
    }

    fn record(&self, identity: &str, endpoint: &str, at: Instant) -> Result<(), StoreError> {
        self.entries
            .entry((identity.to_string(), endpoint.to_string()))
            .or_default()
            .push(at);
        Ok(())
    }
}

/// Sliding-window limiter over a pluggable record store.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Limiter backed by a fresh in-memory store.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(config: RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check and record one attempt for (identity, endpoint) now.
    ///
    /// Returns true (and records the attempt) when the caller is under quota,
    /// false (recording nothing) otherwise.
    pub fn allow(&self, identity: &str, endpoint: &str) -> bool {
        self.allow_at(identity, endpoint, Instant::now())
    }

    /// Same as [`allow`](Self::allow) with an explicit clock reading, for
    /// callers that batch or replay and for deterministic tests.
    pub fn allow_at(&self, identity: &str, endpoint: &str, now: Instant) -> bool {
        let identity = if identity.is_empty() {
            UNKNOWN_IDENTITY
        } else {
            identity
        };
        let window_start = now.checked_sub(self.config.window);

        let count = match self.store.count_since(identity, endpoint, window_start) {
            Ok(count) => count,
            Err(err) => {
                return match self.config.policy {
                    FailurePolicy::FailOpen => {
                        tracing::warn!(identity, endpoint, error = %err,
                            "rate limit store unreachable; allowing (fail-open)");
                        true
                    }
                    FailurePolicy::FailClosed => {
                        tracing::warn!(identity, endpoint, error = %err,
                            "rate limit store unreachable; denying (fail-closed)");
                        false
                    }
                };
            }
        };

        if count >= self.config.max_requests {
            return false;
        }

        match self.store.record(identity, endpoint, now) {
            Ok(()) => true,
            Err(err) => match self.config.policy {
                FailurePolicy::FailOpen => {
                    tracing::warn!(identity, endpoint, error = %err,
                        "rate limit record write failed; allowing (fail-open)");
                    true
                }
                FailurePolicy::FailClosed => {
                    tracing::warn!(identity, endpoint, error = %err,
                        "rate limit record write failed; denying (fail-closed)");
                    false
                }
            },
        }
    }
}

/// Resolve a client identity from proxy headers: first entry of
/// `x-forwarded-for`, else `x-real-ip`, else [`UNKNOWN_IDENTITY`].
pub fn client_identity(forwarded_for: Option<&str>, real_ip: Option<&str>) -> String {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|ip| !ip.is_empty()))
        .unwrap_or(UNKNOWN_IDENTITY)
        .to_string()
}

/// HTTP 429 body returned by inbound handlers when the abuse limiter denies a
/// request. The shape and copy are fixed; clients key off `retryAfter`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TooManyRequests {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

impl TooManyRequests {
    /// HTTP status the body is served with.
    pub const STATUS: u16 = 429;

    /// Value for the `Retry-After` response header, in seconds.
    pub fn retry_after_header(&self) -> String {
        self.retry_after.to_string()
    }
}

impl Default for TooManyRequests {
    fn default() -> Self {
        Self {
            error: "Too many requests. Please try again later.".into(),
            message: "For your security, we limit anonymous usage. \
                      Please wait an hour before trying again."
                .into(),
            retry_after: 3600,
        }
    }
}

/// Quotas for the endpoints ByteSteps actually exposes.
pub mod presets {
    use super::*;

    /// Ordinary serverless endpoint: 10 requests per minute per client,
    /// fail-open so a rate-limit table outage never locks users out.
    pub fn endpoint_default() -> RateLimitConfig {
        RateLimitConfig {
            max_requests: 10,
            window: Duration::from_secs(60),
            policy: FailurePolicy::FailOpen,
        }
    }

    /// Anonymous abuse prevention: 5 requests per hour per IP, fail-closed
    /// because this limiter exists purely for enforcement.
    pub fn anonymous_abuse() -> RateLimitConfig {
        RateLimitConfig {
            max_requests: 5,
            window: Duration::from_secs(3600),
            policy: FailurePolicy::FailClosed,
        }
    }
}
