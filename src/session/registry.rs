//! In-memory session registry.
//!
//! Owns every [`SessionRecord`] and is the only place records are mutated.
//! Callers receive clones; the single `RwLock` makes `set_default` atomic
//! with respect to concurrent readers: no reader ever observes two
//! defaults for one owner mid-update.

use crate::activity::ActivityLog;
use crate::error::{Error, Result};
use crate::session::types::{
    Collaborator, PermissionLevel, SessionPatch, SessionRecord, SessionSpec, SessionState,
};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct SessionRegistry {
    records: RwLock<HashMap<Uuid, SessionRecord>>,
    activity: Arc<dyn ActivityLog>,
    default_max_connections: u32,
}

impl SessionRegistry {
    pub fn new(activity: Arc<dyn ActivityLog>, default_max_connections: u32) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            activity,
            default_max_connections,
        }
    }

    // ── Public surface ────────────────────────────────────────────

    /// Allocate an id, apply defaults, store the record. Owner existence is
    /// an external concern; any `owner_id` is accepted.
    pub fn create(&self, owner_id: &str, spec: SessionSpec) -> SessionRecord {
        let record = SessionRecord::new(owner_id, spec, self.default_max_connections);
        self.records.write().insert(record.id, record.clone());
        self.activity.record(
            record.id,
            owner_id,
            "session_created",
            json!({ "display_name": record.display_name, "alias": record.alias }),
        );
        tracing::info!(session = %record.id, owner = owner_id, "session created");
        record
    }

    pub fn get(&self, id: Uuid) -> Result<SessionRecord> {
        self.records
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Sessions for one owner, sorted by creation time for determinism.
    pub fn list(&self, owner_id: &str) -> Vec<SessionRecord> {
        let mut sessions: Vec<SessionRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Atomically clear `is_default` on the owner's other records and set it
    /// on `id`.
    pub fn set_default(&self, owner_id: &str, id: Uuid) -> Result<SessionRecord> {
        let mut records = self.records.write();
        let owned = records
            .get(&id)
            .is_some_and(|r| r.owner_id == owner_id);
        if !owned {
            return Err(Error::NotFound(id.to_string()));
        }
        for record in records.values_mut() {
            if record.owner_id == owner_id {
                record.is_default = record.id == id;
            }
        }
        Ok(records[&id].clone())
    }

    /// Merge patch fields, bump `last_activity_at`.
    pub fn update(&self, id: Uuid, patch: SessionPatch) -> Result<SessionRecord> {
        let updated = {
            let mut records = self.records.write();
            let record = records
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if let Some(name) = patch.display_name {
                record.display_name = name;
            }
            if let Some(alias) = patch.alias {
                record.alias = alias;
            }
            if let Some(kind) = patch.connection_type {
                record.connection_type = kind;
            }
            if let Some(max) = patch.max_concurrent_connections {
                record.max_concurrent_connections = max;
            }
            if let Some(preferences) = patch.preferences {
                record.preferences.extend(preferences);
            }
            record.last_activity_at = Utc::now();
            record.clone()
        };
        self.activity
            .record(id, &updated.owner_id, "session_updated", json!({}));
        Ok(updated)
    }

    /// Remove the record. The orchestrator is responsible for forcing a
    /// disconnect first; the registry itself does no I/O.
    pub fn remove(&self, id: Uuid) -> Result<SessionRecord> {
        let removed = self
            .records
            .write()
            .remove(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.activity
            .record(id, &removed.owner_id, "session_deleted", json!({}));
        tracing::info!(session = %id, "session removed");
        Ok(removed)
    }

    /// Attach a collaborator. Only the session owner may do this.
    pub fn add_collaborator(
        &self,
        id: Uuid,
        caller_id: &str,
        collaborator_id: &str,
        level: PermissionLevel,
    ) -> Result<SessionRecord> {
        let updated = {
            let mut records = self.records.write();
            let record = records
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            if record.owner_id != caller_id {
                return Err(Error::Unauthorized {
                    caller: caller_id.to_string(),
                    session: id.to_string(),
                });
            }
            if let Some(existing) = record
                .collaborators
                .iter_mut()
                .find(|c| c.user_id == collaborator_id)
            {
                existing.level = level;
                existing.is_active = true;
            } else {
                record.collaborators.push(Collaborator {
                    user_id: collaborator_id.to_string(),
                    level,
                    added_at: Utc::now(),
                    is_active: true,
                });
            }
            record.last_activity_at = Utc::now();
            record.clone()
        };
        self.activity.record(
            id,
            caller_id,
            "collaborator_added",
            json!({ "collaborator": collaborator_id }),
        );
        Ok(updated)
    }

    // ── Supervisor / health hooks ─────────────────────────────────

    /// Move the record to `state`, maintaining the QR and verification
    /// invariants and bumping `last_activity_at`.
    pub fn transition(&self, id: Uuid, state: SessionState) -> Result<SessionRecord> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let from = record.state;
        record.state = state;
        if !state.allows_qr() {
            record.qr_payload = None;
            record.qr_expires_at = None;
        }
        if state == SessionState::Connected {
            record.is_verified = true;
        }
        record.last_activity_at = Utc::now();
        tracing::debug!(session = %id, ?from, to = ?state, "state transition");
        Ok(record.clone())
    }

    /// Store a fresh pairing code and enter `qr_ready`.
    pub fn set_qr(
        &self,
        id: Uuid,
        payload: String,
        expires_at: chrono::DateTime<Utc>,
    ) -> Result<SessionRecord> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.state = SessionState::QrReady;
        record.qr_payload = Some(payload);
        record.qr_expires_at = Some(expires_at);
        record.last_activity_at = Utc::now();
        Ok(record.clone())
    }

    /// Successful pairing: capture the phone number, clear QR fields, mark
    /// verified. `connection_attempts` is left alone: it counts lifetime
    /// attempts, not failures since last success.
    pub fn mark_connected(&self, id: Uuid, phone_number: Option<String>) -> Result<SessionRecord> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.state = SessionState::Connected;
        record.qr_payload = None;
        record.qr_expires_at = None;
        record.is_verified = true;
        if phone_number.is_some() {
            record.phone_number = phone_number;
        }
        record.last_activity_at = Utc::now();
        Ok(record.clone())
    }

    pub fn increment_attempts(&self, id: Uuid) -> Result<u32> {
        let mut records = self.records.write();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        record.connection_attempts = record.connection_attempts.saturating_add(1);
        Ok(record.connection_attempts)
    }

    /// Bump `last_activity_at` (send/receive traffic). A session the health
    /// sweep demoted to `inactive` goes back to `connected`: its transport
    /// never closed, so traffic proves it live again.
    pub fn touch(&self, id: Uuid) {
        if let Some(record) = self.records.write().get_mut(&id) {
            record.last_activity_at = Utc::now();
            if record.state == SessionState::Inactive {
                record.state = SessionState::Connected;
                tracing::info!(session = %id, "traffic resumed; session active again");
            }
        }
    }

    /// Snapshot of every record, for the health sweep.
    pub fn snapshot(&self) -> Vec<SessionRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.records.read().len()
    }

    pub fn owner_count(&self) -> usize {
        let records = self.records.read();
        let mut owners: Vec<&str> = records.values().map(|r| r.owner_id.as_str()).collect();
        owners.sort_unstable();
        owners.dedup();
        owners.len()
    }
}
