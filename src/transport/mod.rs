//! Transport and datastore seams.
//!
//! The orchestrator never speaks the messaging protocol itself. It opens
//! logical connections through a [`TransportFactory`], drives state off the
//! three event kinds every implementation must surface (status change,
//! pairing code, message activity), and sends through the returned
//! [`TransportHandle`]. Pairing state persistence is an opaque blob store
//! keyed by session id.

pub mod memory;
pub mod mock;
pub mod qr;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use memory::MemoryDatastore;
pub use mock::{MockTransportFactory, MockTransportHandle};
pub use qr::render_qr_text;

/// Connection status reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    /// Paired and live. Carries the platform identity when known.
    Open { phone_number: Option<String> },
    Close { reason: CloseReason },
}

/// Why a connection closed. Logout closes are terminal; everything else is
/// treated as an unplanned drop and fed to the reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub kind: CloseKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Explicit logout: the device link was revoked. Do not reconnect.
    LoggedOut,
    /// Network/stream drop. Reconnect with backoff.
    StreamLost,
    Other,
}

impl CloseReason {
    pub fn logged_out(detail: impl Into<String>) -> Self {
        Self {
            kind: CloseKind::LoggedOut,
            detail: detail.into(),
        }
    }

    pub fn stream_lost(detail: impl Into<String>) -> Self {
        Self {
            kind: CloseKind::StreamLost,
            detail: detail.into(),
        }
    }

    pub fn is_logout(&self) -> bool {
        self.kind == CloseKind::LoggedOut
    }
}

/// The three event classes the orchestrator consumes. Events for one
/// session are applied in emission order; cross-session order is undefined.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Status(LinkStatus),
    PairingCode(String),
    MessageActivity { sender: String, payload: String },
}

/// A freshly opened logical connection: the command handle plus the ordered
/// event stream the supervisor's per-session worker consumes.
pub struct TransportSession {
    pub handle: Arc<dyn TransportHandle>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Command side of a live connection. Owned exclusively by the connection
/// supervisor; no other component touches it.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send one payload. Returns the platform message id.
    async fn send(&self, recipient: &str, payload: &str) -> anyhow::Result<String>;

    /// Graceful logout. Best-effort; the handle is released regardless.
    async fn logout(&self) -> anyhow::Result<()>;

    /// Whether the underlying linked-device identity is still present.
    /// Health probe only; must not block on network for long.
    async fn is_identity_present(&self) -> bool;
}

/// Opens logical connections. One open handle per session at a time is the
/// orchestrator's invariant, not the factory's.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        session_id: Uuid,
        datastore: Arc<dyn Datastore>,
    ) -> anyhow::Result<TransportSession>;
}

/// Opaque pairing-state persistence, keyed by session id. Used only by
/// transport implementations; the orchestrator treats it as a directory.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn load(&self, session_id: Uuid) -> anyhow::Result<Option<Vec<u8>>>;
    async fn store(&self, session_id: Uuid, blob: Vec<u8>) -> anyhow::Result<()>;
    async fn delete(&self, session_id: Uuid) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logout_close_is_terminal() {
        assert!(CloseReason::logged_out("device unlinked").is_logout());
        assert!(!CloseReason::stream_lost("stream-lost").is_logout());
        assert!(
            !CloseReason {
                kind: CloseKind::Other,
                detail: "unknown".into()
            }
            .is_logout()
        );
    }

    #[test]
    fn events_are_cloneable_for_fanout() {
        let event = TransportEvent::Status(LinkStatus::Open {
            phone_number: Some("+15550001111".into()),
        });
        let cloned = event.clone();
        match cloned {
            TransportEvent::Status(LinkStatus::Open { phone_number }) => {
                assert_eq!(phone_number.as_deref(), Some("+15550001111"));
            }
            _ => panic!("unexpected variant"),
        }
    }
}
