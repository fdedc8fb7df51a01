//! Scripted transport for tests and host-app dry runs.
//!
//! The factory records every open, exposes the event sender for each
//! session so scenarios can push status/pairing/message events, and lets
//! tests script open failures, per-send failures, and identity loss.

use super::{Datastore, TransportEvent, TransportFactory, TransportHandle, TransportSession};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

#[derive(Default)]
struct SessionScript {
    tx: Option<mpsc::Sender<TransportEvent>>,
    handle: Option<Weak<MockTransportHandle>>,
    open_count: usize,
    /// Events auto-emitted immediately after the next open.
    pending_on_open: VecDeque<TransportEvent>,
    /// Each entry fails one subsequent `open` with the given message.
    fail_opens: VecDeque<String>,
    /// Each entry fails one subsequent `send` with the given message.
    send_failures: VecDeque<String>,
    identity_present: bool,
    sent: Vec<(String, String)>,
    logout_count: usize,
}

#[derive(Default)]
struct MockShared {
    sessions: Mutex<HashMap<Uuid, SessionScript>>,
}

impl MockShared {
    fn with_session<T>(&self, id: Uuid, f: impl FnOnce(&mut SessionScript) -> T) -> T {
        let mut sessions = self.sessions.lock();
        let script = sessions.entry(id).or_insert_with(|| SessionScript {
            identity_present: true,
            ..Default::default()
        });
        f(script)
    }
}

#[derive(Default)]
pub struct MockTransportFactory {
    shared: Arc<MockShared>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an event into a session's live event stream. Returns `false`
    /// when no connection is open (or the worker already hung up).
    pub fn emit(&self, session_id: Uuid, event: TransportEvent) -> bool {
        let tx = self
            .shared
            .with_session(session_id, |script| script.tx.clone());
        match tx {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Queue events to auto-emit right after the next successful open.
    pub fn script_on_open(&self, session_id: Uuid, events: Vec<TransportEvent>) {
        self.shared.with_session(session_id, |script| {
            script.pending_on_open.extend(events);
        });
    }

    /// Make the next `open` for this session fail.
    pub fn fail_next_open(&self, session_id: Uuid, message: &str) {
        let message = message.to_string();
        self.shared.with_session(session_id, |script| {
            script.fail_opens.push_back(message);
        });
    }

    /// Make the next `send` on this session's handle fail.
    pub fn fail_next_send(&self, session_id: Uuid, message: &str) {
        let message = message.to_string();
        self.shared.with_session(session_id, |script| {
            script.send_failures.push_back(message);
        });
    }

    /// Flip the health-probe answer for this session's identity.
    pub fn set_identity_present(&self, session_id: Uuid, present: bool) {
        self.shared.with_session(session_id, |script| {
            script.identity_present = present;
        });
    }

    pub fn open_count(&self, session_id: Uuid) -> usize {
        self.shared
            .with_session(session_id, |script| script.open_count)
    }

    pub fn logout_count(&self, session_id: Uuid) -> usize {
        self.shared
            .with_session(session_id, |script| script.logout_count)
    }

    pub fn sent_messages(&self, session_id: Uuid) -> Vec<(String, String)> {
        self.shared
            .with_session(session_id, |script| script.sent.clone())
    }

    /// Handles still alive anywhere in the process. The supervisor dropping
    /// its handle is what decrements this.
    pub fn live_handle_count(&self) -> usize {
        self.shared
            .sessions
            .lock()
            .values()
            .filter(|script| {
                script
                    .handle
                    .as_ref()
                    .is_some_and(|weak| weak.strong_count() > 0)
            })
            .count()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(
        &self,
        session_id: Uuid,
        _datastore: Arc<dyn Datastore>,
    ) -> anyhow::Result<TransportSession> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let handle = Arc::new(MockTransportHandle {
            session_id,
            shared: Arc::clone(&self.shared),
        });

        let scripted = self.shared.with_session(session_id, |script| {
            script.open_count += 1;
            if let Some(message) = script.fail_opens.pop_front() {
                return Err(anyhow::anyhow!(message));
            }
            script.tx = Some(tx.clone());
            script.handle = Some(Arc::downgrade(&handle));
            Ok(script.pending_on_open.drain(..).collect::<Vec<_>>())
        })?;

        for event in scripted {
            let _ = tx.try_send(event);
        }

        Ok(TransportSession {
            handle,
            events: rx,
        })
    }
}

pub struct MockTransportHandle {
    session_id: Uuid,
    shared: Arc<MockShared>,
}

#[async_trait]
impl TransportHandle for MockTransportHandle {
    async fn send(&self, recipient: &str, payload: &str) -> anyhow::Result<String> {
        self.shared.with_session(self.session_id, |script| {
            if let Some(message) = script.send_failures.pop_front() {
                return Err(anyhow::anyhow!(message));
            }
            script.sent.push((recipient.to_string(), payload.to_string()));
            Ok(Uuid::new_v4().to_string())
        })
    }

    async fn logout(&self) -> anyhow::Result<()> {
        self.shared.with_session(self.session_id, |script| {
            script.logout_count += 1;
        });
        Ok(())
    }

    async fn is_identity_present(&self) -> bool {
        self.shared
            .with_session(self.session_id, |script| script.identity_present)
    }
}
