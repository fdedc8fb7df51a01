//! Connection supervisor: drives each session's state machine.
//!
//! The supervisor is the only component holding live transport handles.
//! Each connected session gets one worker task that consumes the
//! transport's event stream serially; different sessions proceed fully in
//! parallel. Unplanned closes feed a progressive-backoff reconnection loop
//! whose waits are cancellable, so `disconnect` and `delete` never sit out
//! a pending backoff.

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::MetricsLedger;
use crate::session::{SessionRegistry, SessionState};
use crate::transport::{
    CloseReason, Datastore, LinkStatus, TransportEvent, TransportFactory, TransportHandle,
    TransportSession,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What `connect` resolves to once the transport reports its first decisive
/// event (pairing code, open, or close), or the connect wait times out with
/// the record still `connecting`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectOutcome {
    pub state: SessionState,
    pub qr_payload: Option<String>,
    pub qr_expires_at: Option<DateTime<Utc>>,
}

/// One session's live connection slot. `handle` is `None` while the worker
/// waits out a reconnection backoff (the transport is already released).
/// `epoch` ties the slot to the worker generation that owns it, so a
/// cancelled worker racing its replacement never touches the new slot.
struct LiveConnection {
    handle: Option<Arc<dyn TransportHandle>>,
    cancel: CancellationToken,
    opened_at: Option<Instant>,
    epoch: u64,
}

/// How a worker's event-pump phase ended.
enum Disposition {
    /// External cancel (disconnect/delete).
    Cancelled,
    /// Explicit logout close. Terminal, no reconnect.
    LoggedOut,
    /// Unplanned close, fed to the reconnection policy.
    Unplanned(CloseReason),
    /// The record vanished under us (deleted).
    Removed,
}

pub struct ConnectionSupervisor {
    registry: Arc<SessionRegistry>,
    metrics: Arc<MetricsLedger>,
    activity: Arc<dyn ActivityLog>,
    factory: Arc<dyn TransportFactory>,
    datastore: Arc<dyn Datastore>,
    config: Config,
    live: Mutex<HashMap<Uuid, LiveConnection>>,
    epochs: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        metrics: Arc<MetricsLedger>,
        activity: Arc<dyn ActivityLog>,
        factory: Arc<dyn TransportFactory>,
        datastore: Arc<dyn Datastore>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            metrics,
            activity,
            factory,
            datastore,
            config,
            live: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        }
    }

    // ── Public operations ─────────────────────────────────────────

    /// Open a transport for the session and wait for its first decisive
    /// event. A second connect while one is active or in progress is
    /// rejected, not queued.
    pub async fn connect(self: &Arc<Self>, id: Uuid) -> Result<ConnectOutcome> {
        let record = self.registry.get(id)?;

        let cancel = CancellationToken::new();
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        {
            let mut live = self.live.lock();
            if let Some(entry) = live.get(&id) {
                let open = u32::from(entry.handle.is_some());
                if open >= record.max_concurrent_connections {
                    return Err(Error::LimitExceeded {
                        session: id.to_string(),
                        max: record.max_concurrent_connections,
                    });
                }
                return Err(Error::AlreadyConnecting(id.to_string()));
            }
            if record.max_concurrent_connections == 0 {
                return Err(Error::LimitExceeded {
                    session: id.to_string(),
                    max: 0,
                });
            }
            // Reserve the slot before the async open so a racing connect
            // sees it and is rejected.
            live.insert(
                id,
                LiveConnection {
                    handle: None,
                    cancel: cancel.clone(),
                    opened_at: None,
                    epoch,
                },
            );
        }

        let session = match self.open_transport(id, &record.owner_id).await {
            Ok(session) => session,
            Err(err) => {
                self.remove_if_owned(id, epoch);
                return Err(err);
            }
        };

        if !self.arm_handle(id, epoch, &session.handle) {
            // A disconnect or delete raced the open; drop the transport.
            return Err(Error::NotConnected(id.to_string()));
        }

        let (first_tx, first_rx) = oneshot::channel();
        let supervisor = Arc::clone(self);
        let owner = record.owner_id.clone();
        tokio::spawn(supervisor.run_session(
            id,
            owner,
            Some(session.events),
            Some(first_tx),
            cancel,
            0,
            epoch,
        ));

        let wait = Duration::from_secs(self.config.reconnect.connect_timeout_secs);
        match tokio::time::timeout(wait, first_rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // Worker ended without a decisive event; report where the
            // record landed.
            Ok(Err(_)) => Ok(self.outcome_snapshot(id)?),
            Err(_) => {
                tracing::warn!(session = %id, "no transport event within connect window");
                Ok(self.outcome_snapshot(id)?)
            }
        }
    }

    /// Graceful logout if a transport is open; regardless of outcome the
    /// handle is released and the record goes `disconnected`. Interrupts an
    /// in-progress reconnection wait immediately.
    pub async fn disconnect(&self, id: Uuid) -> Result<()> {
        let record = self.registry.get(id)?;

        let entry = self.live.lock().remove(&id);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            if let Some(handle) = entry.handle {
                if let Err(err) = handle.logout().await {
                    tracing::warn!(session = %id, "logout failed: {err}");
                }
                if let Some(opened) = entry.opened_at {
                    self.metrics
                        .add_connection_time(id, elapsed_ms(opened));
                }
            }
        }

        self.registry.transition(id, SessionState::Disconnected)?;
        self.activity.record(
            id,
            &record.owner_id,
            "session_disconnected",
            json!({ "reason": "requested" }),
        );
        Ok(())
    }

    /// Send one payload through the session's live transport.
    pub async fn send(&self, id: Uuid, recipient: &str, payload: &str) -> Result<String> {
        let record = self.registry.get(id)?;
        if record.state != SessionState::Connected {
            return Err(Error::NotConnected(id.to_string()));
        }
        let handle = self
            .live
            .lock()
            .get(&id)
            .and_then(|entry| entry.handle.clone())
            .ok_or_else(|| Error::NotConnected(id.to_string()))?;

        match handle.send(recipient, payload).await {
            Ok(message_id) => {
                self.metrics.record_message_sent(id);
                self.registry.touch(id);
                self.activity.record(
                    id,
                    &record.owner_id,
                    "message_sent",
                    json!({ "recipient": recipient }),
                );
                Ok(message_id)
            }
            Err(err) => {
                self.metrics
                    .record_event(id, "message_send_error", json!({ "error": err.to_string() }));
                Err(Error::Transport(err.to_string()))
            }
        }
    }

    /// Health probe: is the linked-device identity behind this session's
    /// transport still present? `false` when nothing is open.
    pub async fn identity_present(&self, id: Uuid) -> bool {
        let handle = self
            .live
            .lock()
            .get(&id)
            .and_then(|entry| entry.handle.clone());
        match handle {
            Some(handle) => handle.is_identity_present().await,
            None => false,
        }
    }

    /// Health monitor reports a vanished identity: tear the connection down
    /// and restart the normal unplanned-close reconnection path.
    pub fn mark_identity_lost(self: &Arc<Self>, id: Uuid) {
        let Some(entry) = self.live.lock().remove(&id) else {
            return;
        };
        entry.cancel.cancel();
        if let Some(opened) = entry.opened_at {
            self.metrics.add_connection_time(id, elapsed_ms(opened));
        }

        let Ok(record) = self.registry.transition(id, SessionState::Disconnected) else {
            return;
        };
        self.metrics.record_connection_error(id, "identity not present");
        self.activity.record(
            id,
            &record.owner_id,
            "session_disconnected",
            json!({ "reason": "identity_lost" }),
        );
        tracing::warn!(session = %id, "linked-device identity lost; scheduling reconnect");

        let cancel = CancellationToken::new();
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(
            id,
            LiveConnection {
                handle: None,
                cancel: cancel.clone(),
                opened_at: None,
                epoch,
            },
        );
        let supervisor = Arc::clone(self);
        tokio::spawn(supervisor.run_session(id, record.owner_id, None, None, cancel, 0, epoch));
    }

    /// Tear down the session's connection slot without touching the record
    /// state. Used when the pairing window lapses before a scan; the open
    /// transport is useless then and a fresh `connect` issues a new code.
    pub fn release_connection(&self, id: Uuid) {
        let Some(entry) = self.live.lock().remove(&id) else {
            return;
        };
        entry.cancel.cancel();
        if let Some(opened) = entry.opened_at {
            self.metrics.add_connection_time(id, elapsed_ms(opened));
        }
        tracing::debug!(session = %id, "connection slot released");
    }

    /// Transports currently open (not counting reconnect waits).
    pub fn live_transport_count(&self) -> usize {
        self.live
            .lock()
            .values()
            .filter(|entry| entry.handle.is_some())
            .count()
    }

    /// Whether the session holds a connection slot (open or reconnecting).
    pub fn has_live(&self, id: Uuid) -> bool {
        self.live.lock().contains_key(&id)
    }

    // ── Internals ─────────────────────────────────────────────────

    fn outcome_snapshot(&self, id: Uuid) -> Result<ConnectOutcome> {
        let record = self.registry.get(id)?;
        Ok(ConnectOutcome {
            state: record.state,
            qr_payload: record.qr_payload,
            qr_expires_at: record.qr_expires_at,
        })
    }

    /// Transition to `connecting`, count the attempt, open the transport.
    /// An open failure is terminal for this attempt: `connection_failed`,
    /// error recorded, error returned. No internal retry.
    async fn open_transport(&self, id: Uuid, owner: &str) -> Result<TransportSession> {
        self.registry.transition(id, SessionState::Connecting)?;
        let attempt = self.registry.increment_attempts(id)?;
        self.activity
            .record(id, owner, "session_connecting", json!({ "attempt": attempt }));

        match self.factory.open(id, Arc::clone(&self.datastore)).await {
            Ok(session) => Ok(session),
            Err(err) => {
                let detail = err.to_string();
                self.registry
                    .transition(id, SessionState::ConnectionFailed)?;
                self.metrics.record_connection_error(id, &detail);
                self.activity
                    .record(id, owner, "connection_failed", json!({ "error": detail }));
                tracing::warn!(session = %id, "transport open failed: {detail}");
                Err(Error::Transport(detail))
            }
        }
    }

    /// Release the open transport of `id`'s slot, accumulating connection
    /// time. The slot itself stays (reconnect wait) until removed. Only the
    /// owning worker generation may touch the slot.
    fn release_handle(&self, id: Uuid, epoch: u64) {
        let mut live = self.live.lock();
        if let Some(entry) = live.get_mut(&id).filter(|entry| entry.epoch == epoch) {
            entry.handle = None;
            if let Some(opened) = entry.opened_at.take() {
                drop(live);
                self.metrics.add_connection_time(id, elapsed_ms(opened));
            }
        }
    }

    /// Attach a freshly opened transport to the slot, if it is still ours.
    fn arm_handle(&self, id: Uuid, epoch: u64, handle: &Arc<dyn TransportHandle>) -> bool {
        let mut live = self.live.lock();
        match live.get_mut(&id).filter(|entry| entry.epoch == epoch) {
            Some(entry) => {
                entry.handle = Some(Arc::clone(handle));
                entry.opened_at = Some(Instant::now());
                true
            }
            None => false,
        }
    }

    fn owns_slot(&self, id: Uuid, epoch: u64) -> bool {
        self.live
            .lock()
            .get(&id)
            .is_some_and(|entry| entry.epoch == epoch)
    }

    fn remove_if_owned(&self, id: Uuid, epoch: u64) {
        let mut live = self.live.lock();
        if live.get(&id).is_some_and(|entry| entry.epoch == epoch) {
            live.remove(&id);
        }
    }

    /// Per-session worker. Pumps transport events serially; on unplanned
    /// close, waits out the progressive backoff (cancellable) and reopens.
    /// A failed reopen leaves `connection_failed` and ends the worker;
    /// only an explicit retry or the health monitor starts a new one.
    ///
    /// Cleanup ownership: when the worker is cancelled, whoever cancelled
    /// it has already taken (or replaced) the live slot, so the worker must
    /// not touch it. On every other exit the worker removes its own slot.
    #[allow(clippy::too_many_arguments)]
    async fn run_session(
        self: Arc<Self>,
        id: Uuid,
        owner: String,
        mut events: Option<mpsc::Receiver<TransportEvent>>,
        mut first_tx: Option<oneshot::Sender<ConnectOutcome>>,
        cancel: CancellationToken,
        mut backoff_attempt: usize,
        epoch: u64,
    ) {
        loop {
            if let Some(mut stream) = events.take() {
                let disposition = self
                    .pump_events(id, &owner, &mut stream, &mut first_tx, &cancel, &mut backoff_attempt)
                    .await;
                match disposition {
                    Disposition::Cancelled => return,
                    Disposition::LoggedOut | Disposition::Removed => {
                        self.release_handle(id, epoch);
                        self.remove_if_owned(id, epoch);
                        return;
                    }
                    Disposition::Unplanned(reason) => {
                        self.release_handle(id, epoch);
                        tracing::info!(
                            session = %id,
                            reason = %reason.detail,
                            "unplanned close; entering reconnect wait"
                        );
                    }
                }
            }

            // Reconnect wait phase.
            if self
                .registry
                .transition(id, SessionState::Reconnecting)
                .is_err()
            {
                self.remove_if_owned(id, epoch);
                return;
            }
            let delay = self.config.reconnect.delay_for_attempt(backoff_attempt);
            backoff_attempt += 1;
            tracing::debug!(session = %id, delay_secs = delay.as_secs(), "reconnect backoff");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            if !self.owns_slot(id, epoch) {
                return;
            }

            match self.open_transport(id, &owner).await {
                Ok(session) => {
                    if !self.arm_handle(id, epoch, &session.handle) {
                        return;
                    }
                    events = Some(session.events);
                }
                // Reconnection stops on a failed attempt; the record is
                // already `connection_failed`.
                Err(_) => {
                    self.remove_if_owned(id, epoch);
                    return;
                }
            }
        }
    }

    /// Apply transport events for one open connection until it closes, the
    /// worker is cancelled, or the record disappears.
    async fn pump_events(
        &self,
        id: Uuid,
        owner: &str,
        events: &mut mpsc::Receiver<TransportEvent>,
        first_tx: &mut Option<oneshot::Sender<ConnectOutcome>>,
        cancel: &CancellationToken,
        backoff_attempt: &mut usize,
    ) -> Disposition {
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Disposition::Cancelled,
                event = events.recv() => event,
            };

            let Some(event) = event else {
                // Transport dropped its sender without a close event.
                return self.handle_close(
                    id,
                    owner,
                    first_tx,
                    CloseReason::stream_lost("event stream closed"),
                );
            };

            match event {
                TransportEvent::Status(LinkStatus::Connecting) => {
                    // Record is already `connecting`; nothing to apply.
                }
                TransportEvent::PairingCode(code) => {
                    let ttl = chrono::Duration::seconds(
                        i64::try_from(self.config.limits.qr_ttl_secs).unwrap_or(i64::MAX),
                    );
                    let expires_at = Utc::now() + ttl;
                    match self.registry.set_qr(id, code, expires_at) {
                        Ok(record) => {
                            self.metrics
                                .record_event(id, "qr_generated", serde_json::Value::Null);
                            self.activity
                                .record(id, owner, "qr_generated", json!({}));
                            self.notify_first(first_tx, &record);
                        }
                        Err(_) => return Disposition::Removed,
                    }
                }
                TransportEvent::Status(LinkStatus::Open { phone_number }) => {
                    match self.registry.mark_connected(id, phone_number) {
                        Ok(record) => {
                            *backoff_attempt = 0;
                            self.metrics
                                .record_event(id, "connected", serde_json::Value::Null);
                            self.activity.record(
                                id,
                                owner,
                                "session_connected",
                                json!({ "phone_number": record.phone_number }),
                            );
                            tracing::info!(session = %id, "session connected");
                            self.notify_first(first_tx, &record);
                        }
                        Err(_) => return Disposition::Removed,
                    }
                }
                TransportEvent::MessageActivity { sender, .. } => {
                    self.metrics.record_message_received(id);
                    self.registry.touch(id);
                    tracing::debug!(session = %id, from = %sender, "message activity");
                }
                TransportEvent::Status(LinkStatus::Close { reason }) => {
                    return self.handle_close(id, owner, first_tx, reason);
                }
            }
        }
    }

    /// Close handling shared by explicit close events and a dropped event
    /// stream: record goes `disconnected`; logout closes are terminal.
    fn handle_close(
        &self,
        id: Uuid,
        owner: &str,
        first_tx: &mut Option<oneshot::Sender<ConnectOutcome>>,
        reason: CloseReason,
    ) -> Disposition {
        match self.registry.transition(id, SessionState::Disconnected) {
            Ok(record) => {
                self.activity.record(
                    id,
                    owner,
                    "session_disconnected",
                    json!({ "reason": reason.detail }),
                );
                self.notify_first(first_tx, &record);
            }
            Err(_) => return Disposition::Removed,
        }
        if reason.is_logout() {
            tracing::info!(session = %id, "logged out; not reconnecting");
            Disposition::LoggedOut
        } else {
            self.metrics.record_connection_error(id, &reason.detail);
            Disposition::Unplanned(reason)
        }
    }

    fn notify_first(
        &self,
        first_tx: &mut Option<oneshot::Sender<ConnectOutcome>>,
        record: &crate::session::SessionRecord,
    ) {
        if let Some(tx) = first_tx.take() {
            let _ = tx.send(ConnectOutcome {
                state: record.state,
                qr_payload: record.qr_payload.clone(),
                qr_expires_at: record.qr_expires_at,
            });
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}
