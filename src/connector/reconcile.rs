//! Reconciliation loop.
//!
//! A single periodic task that keeps the world converged:
//!
//! 1. reconnect connected sessions that stopped reporting in,
//! 2. live-pull chunks for active sessions,
//! 3. optionally self-heal the circuit breaker,
//! 4. finalize meetings that went idle after their last chunk.
//!
//! It is the only component that mutates sessions outside explicit
//! admin calls, and it goes through the same operation locks, so admin
//! and reconciliation cannot collide.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::ReconcileConfig;
use crate::connector::{ConnectorManager, SessionState};
use crate::error::ConnectorError;
use crate::ingest::IngestService;
use crate::store::MeetingStore;
use crate::trace::TraceContext;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub stale_reconnected: usize,
    pub live_pulled: usize,
    pub live_pull_errors: usize,
    pub breaker_reset: bool,
    pub finalized: usize,
}

pub struct Reconciler {
    store: Arc<dyn MeetingStore>,
    ingest: Arc<IngestService>,
    connector: Option<Arc<ConnectorManager>>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn MeetingStore>,
        ingest: Arc<IngestService>,
        connector: Option<Arc<ConnectorManager>>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            ingest,
            connector,
            config,
        }
    }

    /// Run the loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(interval = ?self.config.interval, "reconciler started");
        let mut ticker = tokio::time::interval(self.config.interval);
        // The first tick fires immediately; skip it so startup settles.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let report = self.run_once().await;
            tracing::debug!(
                stale_reconnected = report.stale_reconnected,
                live_pulled = report.live_pulled,
                live_pull_errors = report.live_pull_errors,
                finalized = report.finalized,
                breaker_reset = report.breaker_reset,
                "reconcile pass complete"
            );
        }
        tracing::info!("reconciler stopped");
    }

    /// One full reconciliation pass. Also reachable from the admin
    /// surface as reconcile-now.
    pub async fn run_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        if let Some(connector) = &self.connector {
            self.reconnect_stale(connector, &mut report).await;
            self.pull_active(connector, &mut report).await;
            self.self_heal_breaker(connector, &mut report).await;
        }
        self.finalize_idle(&mut report).await;

        report
    }

    async fn reconnect_stale(&self, connector: &ConnectorManager, report: &mut ReconcileReport) {
        let seen_before = Utc::now()
            - chrono::Duration::from_std(self.config.stale_after).unwrap_or_default();
        let stale = match self
            .store
            .stale_connected_sessions(
                connector.provider_name(),
                seen_before,
                self.config.reconciliation_limit,
            )
            .await
        {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!("stale-session scan failed: {}", e);
                return;
            }
        };

        for session in stale {
            match connector.reconnect(&session.meeting_id).await {
                Ok(_) => report.stale_reconnected += 1,
                Err(ConnectorError::Busy(_)) => {
                    // An admin call owns the lock; next pass will see it.
                }
                Err(e) => {
                    tracing::warn!(
                        meeting_id = %session.meeting_id,
                        "stale-session reconnect failed: {}", e
                    );
                }
            }
        }
    }

    async fn pull_active(&self, connector: &ConnectorManager, report: &mut ReconcileReport) {
        let sessions = match connector.sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!("session list failed: {}", e);
                return;
            }
        };

        for session in sessions
            .into_iter()
            .filter(|s| s.state == SessionState::Connected)
            .take(connector.config().live_pull_sessions_limit)
        {
            match connector.live_pull(&session.meeting_id).await {
                Ok(pull) => report.live_pulled += pull.ingested,
                Err(ConnectorError::Busy(_)) => {}
                Err(e) => {
                    report.live_pull_errors += 1;
                    tracing::warn!(
                        meeting_id = %session.meeting_id,
                        "live-pull failed: {}", e
                    );
                }
            }
        }
    }

    async fn self_heal_breaker(&self, connector: &ConnectorManager, report: &mut ReconcileReport) {
        let breaker_config = &connector.config().breaker;
        if !breaker_config.self_heal {
            return;
        }
        let breaker = connector.breaker();
        if breaker
            .self_heal_eligible(breaker_config.auto_reset_min_age)
            .await
        {
            breaker
                .reset("reconciler", "self-heal after transient failures")
                .await;
            report.breaker_reset = true;
        }
    }

    /// Inactivity finalizer: the implicit finalize signal. Explicitly
    /// finalized meetings never show up in the scan, so explicit wins.
    async fn finalize_idle(&self, report: &mut ReconcileReport) {
        let idle_before = Utc::now()
            - chrono::Duration::from_std(self.config.finalize_idle).unwrap_or_default();
        let idle = match self
            .store
            .idle_unfinalized(idle_before, self.config.reconciliation_limit)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!("idle-meeting scan failed: {}", e);
                return;
            }
        };

        for meeting_id in idle {
            let trace = TraceContext::new_root();
            match self.ingest.finalize_meeting(&meeting_id, &trace).await {
                Ok(()) => {
                    tracing::info!(meeting_id = %meeting_id, "meeting auto-finalized after idle");
                    report.finalized += 1;
                }
                Err(e) => {
                    tracing::warn!(meeting_id = %meeting_id, "auto-finalize failed: {}", e);
                }
            }
        }
    }
}

/// Spawn the reconciler as a background task tied to the process
/// lifecycle.
pub fn spawn_reconciler(
    reconciler: Arc<Reconciler>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        reconciler.run(shutdown).await;
    })
}
