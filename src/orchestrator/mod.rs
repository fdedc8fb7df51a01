//! Top-level facade tying the registry, supervisor, health monitor,
//! metrics ledger and bulk dispatcher together behind one handle.
//!
//! Every collaborator is injected at construction; the orchestrator owns
//! no ambient globals, so hosts can run several isolated instances (or a
//! fully mocked one) in the same process.

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::dispatch::{BulkDispatcher, BulkItem, BulkOptions, BulkReport};
use crate::error::{Error, Result};
use crate::health::{HealthMonitor, SweepReport};
use crate::metrics::{DailyMetrics, MetricsLedger, OwnerStatistics};
use crate::session::{
    PermissionLevel, SessionPatch, SessionRecord, SessionRegistry, SessionSpec,
};
use crate::supervisor::{ConnectOutcome, ConnectionSupervisor};
use crate::transport::{Datastore, TransportFactory};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One session's record plus its usage counters for today.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session: SessionRecord,
    pub today: DailyMetrics,
}

/// Whole-process snapshot for dashboards and health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub owners: usize,
    pub sessions: usize,
    pub live_transports: usize,
    pub uptime_secs: u64,
}

pub struct Orchestrator {
    registry: Arc<SessionRegistry>,
    metrics: Arc<MetricsLedger>,
    supervisor: Arc<ConnectionSupervisor>,
    dispatcher: BulkDispatcher,
    health: Arc<HealthMonitor>,
    datastore: Arc<dyn Datastore>,
    shutdown: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        factory: Arc<dyn TransportFactory>,
        datastore: Arc<dyn Datastore>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&activity),
            config.limits.max_concurrent_connections,
        ));
        let metrics = Arc::new(MetricsLedger::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            activity,
            factory,
            Arc::clone(&datastore),
            config.clone(),
        ));
        let dispatcher = BulkDispatcher::new(Arc::clone(&supervisor), config.bulk.clone());
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
            config.health.clone(),
        ));
        Self {
            registry,
            metrics,
            supervisor,
            dispatcher,
            health,
            datastore,
            shutdown: CancellationToken::new(),
            health_task: Mutex::new(None),
            started_at: Instant::now(),
        }
    }

    // ── Session management ────────────────────────────────────────

    pub fn create_session(&self, owner_id: &str, spec: SessionSpec) -> SessionRecord {
        self.registry.create(owner_id, spec)
    }

    pub fn get_session(&self, id: Uuid) -> Result<SessionRecord> {
        self.registry.get(id)
    }

    pub fn list_sessions(&self, owner_id: &str) -> Vec<SessionRecord> {
        self.registry.list(owner_id)
    }

    pub fn set_default(&self, owner_id: &str, id: Uuid) -> Result<SessionRecord> {
        self.registry.set_default(owner_id, id)
    }

    pub fn update_session(&self, id: Uuid, patch: SessionPatch) -> Result<SessionRecord> {
        self.registry.update(id, patch)
    }

    pub fn add_collaborator(
        &self,
        id: Uuid,
        caller_id: &str,
        collaborator_id: &str,
        level: PermissionLevel,
    ) -> Result<SessionRecord> {
        self.registry
            .add_collaborator(id, caller_id, collaborator_id, level)
    }

    /// Delete an owned session, forcing a disconnect first so no transport
    /// stays open for a record that no longer exists. Pairing state and
    /// metrics go with it. Only the owner may delete.
    pub async fn delete_session(&self, owner_id: &str, id: Uuid) -> Result<SessionRecord> {
        let record = self.registry.get(id)?;
        if record.owner_id != owner_id {
            return Err(Error::Unauthorized {
                caller: owner_id.to_string(),
                session: id.to_string(),
            });
        }
        if self.supervisor.has_live(id) {
            self.supervisor.disconnect(id).await?;
        }
        let removed = self.registry.remove(id)?;
        self.metrics.remove_session(id);
        if let Err(err) = self.datastore.delete(id).await {
            tracing::warn!(session = %id, "failed to delete pairing state: {err}");
        }
        Ok(removed)
    }

    // ── Connection lifecycle ──────────────────────────────────────

    pub async fn connect(&self, id: Uuid) -> Result<ConnectOutcome> {
        self.supervisor.connect(id).await
    }

    pub async fn disconnect(&self, id: Uuid) -> Result<()> {
        self.supervisor.disconnect(id).await
    }

    // ── Messaging ─────────────────────────────────────────────────

    pub async fn send(&self, id: Uuid, recipient: &str, payload: &str) -> Result<String> {
        self.supervisor.send(id, recipient, payload).await
    }

    pub async fn send_bulk(
        &self,
        id: Uuid,
        items: Vec<BulkItem>,
        opts: Option<BulkOptions>,
    ) -> BulkReport {
        self.dispatcher.send_bulk(id, items, opts).await
    }

    // ── Status and statistics ─────────────────────────────────────

    pub fn get_session_status(&self, id: Uuid) -> Result<SessionStatus> {
        let session = self.registry.get(id)?;
        Ok(SessionStatus {
            today: self.metrics.today(id),
            session,
        })
    }

    pub fn get_session_statistics(&self, owner_id: &str) -> OwnerStatistics {
        let ids: Vec<Uuid> = self
            .registry
            .list(owner_id)
            .into_iter()
            .map(|record| record.id)
            .collect();
        self.metrics.owner_statistics(&ids)
    }

    pub fn get_system_status(&self) -> SystemStatus {
        SystemStatus {
            owners: self.registry.owner_count(),
            sessions: self.registry.session_count(),
            live_transports: self.supervisor.live_transport_count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    // ── Health monitor ────────────────────────────────────────────

    /// Start the periodic health sweep. Idempotent; a second call while
    /// one loop runs is a no-op.
    pub fn start_health_monitor(&self) {
        let mut task = self.health_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *task = Some(self.health.start(self.shutdown.child_token()));
    }

    /// Run one health sweep immediately, outside the periodic loop.
    pub async fn run_health_sweep(&self) -> SweepReport {
        self.health.sweep().await
    }

    /// Stop the health loop and disconnect every session. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let task = self.health_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        for record in self.registry.snapshot() {
            if self.supervisor.has_live(record.id) {
                if let Err(err) = self.supervisor.disconnect(record.id).await {
                    tracing::warn!(session = %record.id, "disconnect during shutdown: {err}");
                }
            }
        }
        tracing::info!("orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::NoopActivityLog;
    use crate::session::SessionState;
    use crate::transport::{
        LinkStatus, MemoryDatastore, MockTransportFactory, TransportEvent,
    };
    use std::time::Duration;

    fn orchestrator() -> (Orchestrator, Arc<MockTransportFactory>) {
        let factory = Arc::new(MockTransportFactory::new());
        let orchestrator = Orchestrator::new(
            Config::default(),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::new(MemoryDatastore::new()),
            Arc::new(NoopActivityLog),
        );
        (orchestrator, factory)
    }

    fn spec(name: &str) -> SessionSpec {
        SessionSpec {
            display_name: Some(name.into()),
            ..Default::default()
        }
    }

    async fn wait_for_state(o: &Orchestrator, id: Uuid, state: SessionState) {
        let poll = async {
            while !o.get_session(id).is_ok_and(|r| r.state == state) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), poll)
            .await
            .expect("state never reached");
    }

    #[tokio::test(start_paused = true)]
    async fn system_status_counts_owners_sessions_and_transports() {
        let (o, factory) = orchestrator();
        let a = o.create_session("u1", spec("A")).id;
        o.create_session("u1", spec("B"));
        o.create_session("u2", spec("C"));

        factory.script_on_open(
            a,
            vec![TransportEvent::Status(LinkStatus::Open {
                phone_number: None,
            })],
        );
        o.connect(a).await.unwrap();
        wait_for_state(&o, a, SessionState::Connected).await;

        let status = o.get_system_status();
        assert_eq!(status.owners, 2);
        assert_eq!(status.sessions, 3);
        assert_eq!(status.live_transports, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_connected_session_leaves_no_live_transport() {
        let (o, factory) = orchestrator();
        let id = o.create_session("u1", spec("A")).id;
        factory.script_on_open(
            id,
            vec![TransportEvent::Status(LinkStatus::Open {
                phone_number: None,
            })],
        );
        o.connect(id).await.unwrap();
        wait_for_state(&o, id, SessionState::Connected).await;

        o.delete_session("u1", id).await.unwrap();
        assert!(o.get_session(id).is_err());
        assert_eq!(o.get_system_status().live_transports, 0);
        assert_eq!(factory.logout_count(id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_session_requires_owner() {
        let (o, factory) = orchestrator();
        let id = o.create_session("u1", spec("A")).id;
        factory.script_on_open(
            id,
            vec![TransportEvent::Status(LinkStatus::Open {
                phone_number: None,
            })],
        );
        o.connect(id).await.unwrap();
        wait_for_state(&o, id, SessionState::Connected).await;

        let err = o.delete_session("u2", id).await.unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
        // Record and transport survive the foreign attempt.
        assert!(o.get_session(id).is_ok());
        assert_eq!(o.get_system_status().live_transports, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_status_includes_daily_counters() {
        let (o, factory) = orchestrator();
        let id = o.create_session("u1", spec("A")).id;
        factory.script_on_open(
            id,
            vec![TransportEvent::Status(LinkStatus::Open {
                phone_number: None,
            })],
        );
        o.connect(id).await.unwrap();
        wait_for_state(&o, id, SessionState::Connected).await;
        o.send(id, "+1555", "hi").await.unwrap();

        let status = o.get_session_status(id).unwrap();
        assert_eq!(status.session.state, SessionState::Connected);
        assert_eq!(status.today.messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn statistics_are_scoped_to_owner() {
        let (o, factory) = orchestrator();
        let mine = o.create_session("u1", spec("Mine")).id;
        let theirs = o.create_session("u2", spec("Theirs")).id;
        for id in [mine, theirs] {
            factory.script_on_open(
                id,
                vec![TransportEvent::Status(LinkStatus::Open {
                    phone_number: None,
                })],
            );
            o.connect(id).await.unwrap();
            wait_for_state(&o, id, SessionState::Connected).await;
        }
        o.send(mine, "+1555", "a").await.unwrap();
        o.send(theirs, "+1555", "b").await.unwrap();
        o.send(theirs, "+1555", "c").await.unwrap();

        let stats = o.get_session_statistics("u2");
        assert_eq!(stats.sessions.len(), 1);
        assert_eq!(stats.total_messages_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_disconnects_everything_and_stops_health() {
        let (o, factory) = orchestrator();
        let id = o.create_session("u1", spec("A")).id;
        factory.script_on_open(
            id,
            vec![TransportEvent::Status(LinkStatus::Open {
                phone_number: None,
            })],
        );
        o.connect(id).await.unwrap();
        wait_for_state(&o, id, SessionState::Connected).await;
        o.start_health_monitor();

        o.shutdown().await;
        assert_eq!(o.get_system_status().live_transports, 0);
        assert_eq!(
            o.get_session(id).unwrap().state,
            SessionState::Disconnected
        );
        // A second shutdown is harmless.
        o.shutdown().await;
    }
}
