//! Session data model: the record describing one logical linked-device
//! identity, its lifecycle states, and the create/update parameter types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle state of a session's connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Connecting,
    QrReady,
    QrExpired,
    Connected,
    Disconnected,
    Reconnecting,
    ConnectionFailed,
    Inactive,
    Error,
}

impl SessionState {
    /// States in which a pairing QR payload may be present on the record.
    pub fn allows_qr(self) -> bool {
        matches!(self, SessionState::QrReady)
    }
}

/// How the linked device presents itself to the platform. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Mobile,
    #[default]
    LinkedDevice,
}

/// Access level granted to a collaborator on someone else's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    View,
    Operate,
    Admin,
}

/// A secondary account granted rights on a session. Authorization metadata
/// only; enforcement beyond owner checks is the host application's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: String,
    pub level: PermissionLevel,
    pub added_at: DateTime<Utc>,
    pub is_active: bool,
}

/// One logical linked-device identity owned by an operator account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub display_name: String,
    /// Short code derived from `display_name` when not supplied.
    pub alias: String,
    /// Populated on successful pairing.
    pub phone_number: Option<String>,
    pub connection_type: ConnectionType,
    pub state: SessionState,
    /// Present only while `state == qr_ready`.
    pub qr_payload: Option<String>,
    pub qr_expires_at: Option<DateTime<Utc>>,
    /// Lifetime connection attempts. Never reset on success.
    pub connection_attempts: u32,
    /// Per-session cap on concurrently open transports.
    pub max_concurrent_connections: u32,
    /// At most one `true` per owner.
    pub is_default: bool,
    /// Set the first time the session reaches `connected`.
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Free-form host preferences (auto-reply, business hours, timezone…).
    /// Opaque to the orchestrator.
    #[serde(default)]
    pub preferences: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub collaborators: Vec<Collaborator>,
}

impl SessionRecord {
    pub fn new(owner_id: &str, spec: SessionSpec, default_max_connections: u32) -> Self {
        let now = Utc::now();
        let display_name = spec.display_name.unwrap_or_default();
        let alias = match spec.alias {
            Some(alias) if !alias.trim().is_empty() => alias,
            _ => derive_alias(&display_name),
        };
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            display_name,
            alias,
            phone_number: None,
            connection_type: spec.connection_type.unwrap_or_default(),
            state: SessionState::Initializing,
            qr_payload: None,
            qr_expires_at: None,
            connection_attempts: 0,
            max_concurrent_connections: spec
                .max_concurrent_connections
                .unwrap_or(default_max_connections),
            is_default: false,
            is_verified: false,
            created_at: now,
            last_activity_at: now,
            preferences: spec.preferences.unwrap_or_default(),
            collaborators: Vec::new(),
        }
    }
}

/// Parameters accepted when creating a session. Everything is optional;
/// unset fields fall back to documented defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSpec {
    pub display_name: Option<String>,
    pub alias: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub max_concurrent_connections: Option<u32>,
    pub preferences: Option<HashMap<String, serde_json::Value>>,
}

/// Partial update applied by `update`. State and pairing identity fields are
/// owned by the connection supervisor and are not patchable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    pub display_name: Option<String>,
    pub alias: Option<String>,
    pub connection_type: Option<ConnectionType>,
    pub max_concurrent_connections: Option<u32>,
    /// Merged key-by-key into existing preferences.
    pub preferences: Option<HashMap<String, serde_json::Value>>,
}

/// Derive a short alias: first letter of each word, uppercased; single-word
/// names are uppercased whole; empty names get a random 3-letter code.
pub fn derive_alias(display_name: &str) -> String {
    let words: Vec<&str> = display_name.split_whitespace().collect();
    match words.len() {
        0 => random_alias(),
        1 => words[0].to_uppercase(),
        _ => words
            .iter()
            .filter_map(|w| w.chars().next())
            .flat_map(char::to_uppercase)
            .collect(),
    }
}

fn random_alias() -> String {
    use rand::RngExt;
    let mut rng = rand::rng();
    (0..3)
        .map(|_| char::from(b'A' + rng.random_range(0..26u8)))
        .collect()
}
