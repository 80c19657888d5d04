//! Append-only audit log of operation outcomes.
//!
//! Every attempted call gets a record (success or failure), as does every
//! circuit-breaker trip. Records feed diagnostics and the compliance audit
//! trail the wider application keeps, so logging is strictly best-effort: a
//! broken audit path must never break the call it was observing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::StoreError;

/// Well-known action names shared between the pipeline and its consumers.
pub mod actions {
    /// An attempt completed successfully.
    pub const API_SUCCESS: &str = "api_success";
    /// An attempt failed (one record per failed attempt).
    pub const API_ERROR: &str = "api_error";
    /// A breaker transitioned to Open.
    pub const CIRCUIT_BREAKER_OPENED: &str = "circuit_breaker_opened";
}

/// One recorded outcome. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Absent for anonymous traffic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub action: String,
    /// Open payload: operation name, attempt number, error text, and so on.
    pub details: Value,
}

/// Durable backend for audit events (e.g. a remote `audit_logs` table).
///
/// Implementations may buffer or ship asynchronously; the sink only requires
/// that `append` reports delivery problems so they can be logged and dropped.
pub trait AuditStore: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<(), StoreError>;
}

/// In-process audit sink with FIFO retention and optional remote forwarding.
///
/// `record` never panics and never surfaces an error: internal failures are
/// logged via `tracing` and swallowed, so audit logging cannot introduce new
/// failures into the call path it observes.
pub struct AuditSink {
    events: Mutex<VecDeque<AuditEvent>>,
    capacity: usize,
    store: Option<Arc<dyn AuditStore>>,
}

impl AuditSink {
    /// Default retention cap. Oldest entries beyond this are evicted first.
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity,
            store: None,
        }
    }

    /// Sink that also forwards every event to a durable store.
    pub fn with_store(capacity: usize, store: Arc<dyn AuditStore>) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity,
            store: Some(store),
        }
    }

    /// Record an anonymous event.
    pub fn record(&self, action: &str, details: Value) {
        self.record_for_user(None, action, details);
    }

    /// Record an event attributed to a user.
    pub fn record_for_user(&self, user_id: Option<&str>, action: &str, details: Value) {
        let event = AuditEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            user_id: user_id.map(str::to_string),
            action: action.to_string(),
            details,
        };

        if let Some(store) = &self.store {
            if let Err(err) = store.append(&event) {
                // Swallowed on purpose: a dead audit store must not fail the
                // operation being audited, and retrying here could loop.
                tracing::warn!(action, error = %err, "audit store append failed; event kept locally only");
            }
        }

        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// Snapshot of currently retained events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-delete every retained event attributed to `user_id`, returning how
    /// many were removed. Supports user data-deletion requests.
    pub fn purge_user(&self, user_id: &str) -> usize {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = events.len();
        events.retain(|event| event.user_id.as_deref() != Some(user_id));
        before - events.len()
    }
}

impl Default for AuditSink {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_are_retained_in_order() {
        let sink = AuditSink::default();
        sink.record(actions::API_SUCCESS, json!({ "operation": "tts", "attempt": 1 }));
        sink.record(actions::API_ERROR, json!({ "operation": "tts", "attempt": 1 }));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, actions::API_SUCCESS);
        assert_eq!(events[1].action, actions::API_ERROR);
        assert!(events[0].user_id.is_none());
    }

    #[test]
    fn oldest_events_are_evicted_beyond_capacity() {
        let sink = AuditSink::new(1000);
        for i in 0..1050u32 {
            sink.record(actions::API_SUCCESS, json!({ "n": i }));
        }

        let events = sink.events();
        assert_eq!(events.len(), 1000);
        // The 50 oldest were dropped; the survivors are 50..1049.
        assert_eq!(events[0].details["n"], 50);
        assert_eq!(events[999].details["n"], 1049);
    }

    #[test]
    fn purge_user_removes_only_that_user() {
        let sink = AuditSink::default();
        sink.record_for_user(Some("user-a"), actions::API_SUCCESS, json!({}));
        sink.record_for_user(Some("user-b"), actions::API_SUCCESS, json!({}));
        sink.record(actions::API_SUCCESS, json!({}));

        assert_eq!(sink.purge_user("user-a"), 1);
        assert_eq!(sink.len(), 2);
        assert!(sink
            .events()
            .iter()
            .all(|e| e.user_id.as_deref() != Some("user-a")));
    }

    struct BrokenStore;

    impl AuditStore for BrokenStore {
        fn append(&self, _event: &AuditEvent) -> Result<(), StoreError> {
            Err(StoreError("remote table unavailable".into()))
        }
    }

    #[test]
    fn store_failure_is_swallowed_and_event_kept_locally() {
        let sink = AuditSink::with_store(10, Arc::new(BrokenStore));
        sink.record(actions::API_ERROR, json!({ "operation": "llm" }));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn events_serialize_with_details() {
        let sink = AuditSink::default();
        sink.record_for_user(
            Some("user-1"),
            actions::API_ERROR,
            json!({ "operation": "llm", "attempt": 2, "error": "HTTP 503" }),
        );

        let event = &sink.events()[0];
        let encoded = serde_json::to_value(event).unwrap();
        assert_eq!(encoded["action"], "api_error");
        assert_eq!(encoded["user_id"], "user-1");
        assert_eq!(encoded["details"]["attempt"], 2);
    }
}
