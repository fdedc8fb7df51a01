//! Periodic health sweep over all sessions.
//!
//! One background task wakes on a fixed interval and applies three checks
//! per session: pairing-code expiry, idle-connection demotion, and a
//! linked-device identity probe. The sweep itself is a plain async method
//! so hosts (and tests) can also invoke it on demand.

use crate::config::HealthConfig;
use crate::session::{SessionRegistry, SessionState};
use crate::supervisor::ConnectionSupervisor;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What one sweep did, for logging and for host-app surfacing.
#[derive(Debug, Default, Clone)]
pub struct SweepReport {
    pub qr_expired: Vec<Uuid>,
    pub marked_inactive: Vec<Uuid>,
    pub identity_lost: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.qr_expired.is_empty() && self.marked_inactive.is_empty() && self.identity_lost.is_empty()
    }
}

pub struct HealthMonitor {
    registry: Arc<SessionRegistry>,
    supervisor: Arc<ConnectionSupervisor>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        supervisor: Arc<ConnectionSupervisor>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            supervisor,
            config,
        }
    }

    /// Spawn the sweep loop. Runs until `cancel` fires; the first sweep
    /// happens one full interval after start, not immediately.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(monitor.config.sweep_interval_secs);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately on the first tick; consume it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let report = monitor.sweep().await;
                if !report.is_empty() {
                    tracing::info!(
                        qr_expired = report.qr_expired.len(),
                        inactive = report.marked_inactive.len(),
                        identity_lost = report.identity_lost.len(),
                        "health sweep applied changes"
                    );
                }
            }
            tracing::debug!("health monitor stopped");
        })
    }

    /// One pass over every session.
    pub async fn sweep(&self) -> SweepReport {
        let now = Utc::now();
        let threshold = chrono::Duration::seconds(
            i64::try_from(self.config.inactivity_threshold_secs).unwrap_or(i64::MAX),
        );
        let mut report = SweepReport::default();

        for record in self.registry.snapshot() {
            match record.state {
                SessionState::QrReady => {
                    let expired = record.qr_expires_at.is_some_and(|at| at <= now);
                    if expired {
                        // A lapsed code can never be scanned; the pending
                        // transport goes with it.
                        self.supervisor.release_connection(record.id);
                        if self
                            .registry
                            .transition(record.id, SessionState::QrExpired)
                            .is_ok()
                        {
                            tracing::info!(session = %record.id, "pairing code expired");
                            report.qr_expired.push(record.id);
                        }
                    }
                }
                SessionState::Connected => {
                    // Identity first: a vanished linked device trumps
                    // idleness and routes into the reconnect path.
                    if !self.supervisor.identity_present(record.id).await {
                        self.supervisor.mark_identity_lost(record.id);
                        report.identity_lost.push(record.id);
                        continue;
                    }
                    // Idle demotion is bookkeeping only; the transport
                    // stays open and fresh inbound traffic flips the
                    // record back to connected.
                    if now - record.last_activity_at >= threshold
                        && self
                            .registry
                            .transition(record.id, SessionState::Inactive)
                            .is_ok()
                    {
                        tracing::info!(session = %record.id, "session idle, marked inactive");
                        report.marked_inactive.push(record.id);
                    }
                }
                _ => {}
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityLog, NoopActivityLog};
    use crate::config::Config;
    use crate::metrics::MetricsLedger;
    use crate::session::SessionSpec;
    use crate::transport::{
        LinkStatus, MemoryDatastore, MockTransportFactory, TransportEvent, TransportFactory,
    };

    struct Harness {
        registry: Arc<SessionRegistry>,
        factory: Arc<MockTransportFactory>,
        supervisor: Arc<ConnectionSupervisor>,
    }

    fn harness_with(config: Config) -> Harness {
        let activity: Arc<dyn ActivityLog> = Arc::new(NoopActivityLog);
        let registry = Arc::new(SessionRegistry::new(Arc::clone(&activity), 5));
        let factory = Arc::new(MockTransportFactory::new());
        let supervisor = Arc::new(ConnectionSupervisor::new(
            Arc::clone(&registry),
            Arc::new(MetricsLedger::new()),
            activity,
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::new(MemoryDatastore::new()),
            config,
        ));
        Harness {
            registry,
            factory,
            supervisor,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    fn monitor(h: &Harness, config: HealthConfig) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            Arc::clone(&h.registry),
            Arc::clone(&h.supervisor),
            config,
        ))
    }

    fn session(h: &Harness) -> Uuid {
        h.registry
            .create(
                "owner-1",
                SessionSpec {
                    display_name: Some("Sales".into()),
                    ..Default::default()
                },
            )
            .id
    }

    async fn connect_open(h: &Harness, id: Uuid) {
        h.factory.script_on_open(
            id,
            vec![TransportEvent::Status(LinkStatus::Open {
                phone_number: None,
            })],
        );
        h.supervisor.connect(id).await.unwrap();
        let settle = async {
            while h.registry.get(id).unwrap().state != SessionState::Connected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), settle)
            .await
            .expect("session never connected");
    }

    #[tokio::test]
    async fn sweep_expires_stale_qr() {
        let h = harness();
        let id = session(&h);
        h.registry
            .set_qr(id, "STALE".into(), Utc::now() - chrono::Duration::seconds(1))
            .unwrap();

        let report = monitor(&h, HealthConfig::default()).sweep().await;
        assert_eq!(report.qr_expired, vec![id]);
        let record = h.registry.get(id).unwrap();
        assert_eq!(record.state, SessionState::QrExpired);
        assert!(record.qr_payload.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_qr_releases_the_pending_transport() {
        let mut config = Config::default();
        config.limits.qr_ttl_secs = 0;
        let h = harness_with(config);
        let id = session(&h);
        h.factory
            .script_on_open(id, vec![TransportEvent::PairingCode("QR".into())]);
        h.supervisor.connect(id).await.unwrap();
        assert_eq!(h.registry.get(id).unwrap().state, SessionState::QrReady);
        assert_eq!(h.supervisor.live_transport_count(), 1);

        let report = monitor(&h, HealthConfig::default()).sweep().await;
        assert_eq!(report.qr_expired, vec![id]);
        assert_eq!(h.registry.get(id).unwrap().state, SessionState::QrExpired);
        assert_eq!(h.supervisor.live_transport_count(), 0);
        assert!(!h.supervisor.has_live(id));
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_qr() {
        let h = harness();
        let id = session(&h);
        h.registry
            .set_qr(id, "FRESH".into(), Utc::now() + chrono::Duration::seconds(120))
            .unwrap();

        let report = monitor(&h, HealthConfig::default()).sweep().await;
        assert!(report.is_empty());
        assert_eq!(h.registry.get(id).unwrap().state, SessionState::QrReady);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_marks_idle_connected_session_inactive() {
        let h = harness();
        let id = session(&h);
        connect_open(&h, id).await;

        let config = HealthConfig {
            inactivity_threshold_secs: 0,
            ..Default::default()
        };
        let report = monitor(&h, config).sweep().await;
        assert_eq!(report.marked_inactive, vec![id]);
        assert_eq!(h.registry.get(id).unwrap().state, SessionState::Inactive);
        // The transport is left open.
        assert_eq!(h.supervisor.live_transport_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_detects_identity_loss_before_idleness() {
        let h = harness();
        let id = session(&h);
        connect_open(&h, id).await;
        h.factory.set_identity_present(id, false);

        let config = HealthConfig {
            inactivity_threshold_secs: 0,
            ..Default::default()
        };
        let report = monitor(&h, config).sweep().await;
        assert_eq!(report.identity_lost, vec![id]);
        assert!(report.marked_inactive.is_empty());

        // Reconnect path engages from attempt zero.
        let settle = async {
            while h.registry.get(id).unwrap().state != SessionState::Reconnecting {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(60), settle)
            .await
            .expect("identity loss never entered reconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn loop_sweeps_on_interval_until_cancelled() {
        let h = harness();
        let id = session(&h);
        h.registry
            .set_qr(id, "STALE".into(), Utc::now() - chrono::Duration::seconds(1))
            .unwrap();

        let config = HealthConfig {
            sweep_interval_secs: 5,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        let handle = monitor(&h, config).start(cancel.clone());

        // Nothing before the first interval elapses.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.registry.get(id).unwrap().state, SessionState::QrReady);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.registry.get(id).unwrap().state, SessionState::QrExpired);

        cancel.cancel();
        handle.await.unwrap();
    }
}
