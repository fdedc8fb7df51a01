//! Per-session daily usage metrics.
//!
//! Counters are keyed by `(session_id, calendar_day)`. Each day keeps the
//! most recent 100 discrete events: a bounded ring, not an unbounded log.
//! Writers are the components reporting the corresponding event; the
//! per-session worker already serializes them.

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

const MAX_EVENTS_PER_DAY: usize = 100;

/// One discrete metric event retained in the daily ring.
#[derive(Debug, Clone, Serialize)]
pub struct MetricEvent {
    pub kind: String,
    pub at: chrono::DateTime<Utc>,
    pub detail: serde_json::Value,
}

/// Counters for one session on one calendar day.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DailyMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connection_errors: u64,
    pub connection_time_ms: u64,
    pub events: VecDeque<MetricEvent>,
}

impl DailyMetrics {
    fn push_event(&mut self, kind: &str, detail: serde_json::Value) {
        if self.events.len() == MAX_EVENTS_PER_DAY {
            self.events.pop_front();
        }
        self.events.push_back(MetricEvent {
            kind: kind.to_string(),
            at: Utc::now(),
            detail,
        });
    }
}

/// Today's counters for one session, plus identity, as reported upward.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatistics {
    pub session_id: Uuid,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub connection_errors: u64,
    pub connection_time_ms: u64,
}

/// Aggregate across one owner's sessions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OwnerStatistics {
    pub sessions: Vec<SessionStatistics>,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub total_connection_errors: u64,
    pub total_connection_time_ms: u64,
}

#[derive(Default)]
pub struct MetricsLedger {
    days: Mutex<HashMap<(Uuid, NaiveDate), DailyMetrics>>,
}

impl MetricsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_today<T>(&self, session_id: Uuid, f: impl FnOnce(&mut DailyMetrics) -> T) -> T {
        let key = (session_id, Utc::now().date_naive());
        let mut days = self.days.lock();
        f(days.entry(key).or_default())
    }

    pub fn record_message_sent(&self, session_id: Uuid) {
        self.with_today(session_id, |day| {
            day.messages_sent += 1;
            day.push_event("message_sent", serde_json::Value::Null);
        });
    }

    pub fn record_message_received(&self, session_id: Uuid) {
        self.with_today(session_id, |day| {
            day.messages_received += 1;
            day.push_event("message_received", serde_json::Value::Null);
        });
    }

    pub fn record_connection_error(&self, session_id: Uuid, detail: &str) {
        self.with_today(session_id, |day| {
            day.connection_errors += 1;
            day.push_event("connection_error", serde_json::json!({ "detail": detail }));
        });
    }

    /// A discrete event without a counter (e.g. `message_send_error`,
    /// `connected`, `qr_generated`).
    pub fn record_event(&self, session_id: Uuid, kind: &str, detail: serde_json::Value) {
        self.with_today(session_id, |day| day.push_event(kind, detail));
    }

    /// Accumulate time a transport spent open, reported on close.
    pub fn add_connection_time(&self, session_id: Uuid, elapsed_ms: u64) {
        self.with_today(session_id, |day| day.connection_time_ms += elapsed_ms);
    }

    /// Today's counters for one session. Zeroed when nothing was recorded.
    pub fn today(&self, session_id: Uuid) -> DailyMetrics {
        let key = (session_id, Utc::now().date_naive());
        self.days.lock().get(&key).cloned().unwrap_or_default()
    }

    /// Drop every day for a deleted session.
    pub fn remove_session(&self, session_id: Uuid) {
        self.days.lock().retain(|(id, _), _| *id != session_id);
    }

    /// Today's counters for the given sessions plus aggregate totals.
    pub fn owner_statistics(&self, session_ids: &[Uuid]) -> OwnerStatistics {
        let mut stats = OwnerStatistics::default();
        for &session_id in session_ids {
            let day = self.today(session_id);
            stats.total_messages_sent += day.messages_sent;
            stats.total_messages_received += day.messages_received;
            stats.total_connection_errors += day.connection_errors;
            stats.total_connection_time_ms += day.connection_time_ms;
            stats.sessions.push(SessionStatistics {
                session_id,
                messages_sent: day.messages_sent,
                messages_received: day.messages_received,
                connection_errors: day.connection_errors,
                connection_time_ms: day.connection_time_ms,
            });
        }
        stats
    }
}
