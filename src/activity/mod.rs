//! Activity log: append-only, fire-and-forget sink for lifecycle events.
//!
//! The orchestrator never reads activity back; the seam exists so external
//! observability or storage can subscribe. Implementations must swallow
//! their own failures: a log write never fails the originating operation.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

/// One recorded activity entry, as handed to sinks.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub session_id: Uuid,
    pub owner_id: String,
    pub activity_type: String,
    pub details: serde_json::Value,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Write-only activity sink. Infallible by contract.
pub trait ActivityLog: Send + Sync {
    fn record(&self, session_id: Uuid, owner_id: &str, activity_type: &str, details: serde_json::Value);

    fn name(&self) -> &str;
}

/// Discards everything.
pub struct NoopActivityLog;

impl ActivityLog for NoopActivityLog {
    fn record(&self, _: Uuid, _: &str, _: &str, _: serde_json::Value) {}

    fn name(&self) -> &str {
        "noop"
    }
}

/// Emits each activity as a structured `tracing` line.
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn record(&self, session_id: Uuid, owner_id: &str, activity_type: &str, details: serde_json::Value) {
        tracing::info!(
            session = %session_id,
            owner = owner_id,
            activity = activity_type,
            details = %details,
            "session activity"
        );
    }

    fn name(&self) -> &str {
        "tracing"
    }
}

/// Keeps the most recent entries in memory. Useful for tests and for hosts
/// that poll rather than subscribe.
pub struct MemoryActivityLog {
    entries: Mutex<VecDeque<ActivityEntry>>,
    capacity: usize,
}

impl MemoryActivityLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn types_for(&self, session_id: Uuid) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .map(|e| e.activity_type.clone())
            .collect()
    }
}

impl Default for MemoryActivityLog {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ActivityLog for MemoryActivityLog {
    fn record(&self, session_id: Uuid, owner_id: &str, activity_type: &str, details: serde_json::Value) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(ActivityEntry {
            session_id,
            owner_id: owner_id.to_string(),
            activity_type: activity_type.to_string(),
            details,
            at: chrono::Utc::now(),
        });
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn noop_name() {
        assert_eq!(NoopActivityLog.name(), "noop");
    }

    #[test]
    fn noop_record_does_not_panic() {
        NoopActivityLog.record(Uuid::new_v4(), "owner", "session_created", json!({}));
    }

    #[test]
    fn memory_log_retains_entries() {
        let log = MemoryActivityLog::default();
        let id = Uuid::new_v4();
        log.record(id, "owner-1", "session_created", json!({"name": "Sales"}));
        log.record(id, "owner-1", "session_connected", json!({}));

        let types = log.types_for(id);
        assert_eq!(types, vec!["session_created", "session_connected"]);
    }

    #[test]
    fn memory_log_drops_oldest_at_capacity() {
        let log = MemoryActivityLog::new(2);
        let id = Uuid::new_v4();
        log.record(id, "o", "first", json!({}));
        log.record(id, "o", "second", json!({}));
        log.record(id, "o", "third", json!({}));

        let types = log.types_for(id);
        assert_eq!(types, vec!["second", "third"]);
    }
}
