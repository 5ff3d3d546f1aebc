//! Connector lifecycle manager.
//!
//! Per-meeting session state machine over a provider adapter:
//!
//! ```text
//! (absent) --join--> joining --ok--> connected
//!   joining --terminal fail--> dead
//!   connected --health fail xN--> disconnected --reconnect--> joining
//!   connected --leave--> leaving --ok--> (absent)
//!   disconnected --leave--> (absent)
//! ```
//!
//! Every public operation takes the per-meeting operation lock (a TTL
//! lease in the broker); concurrent operations on the same meeting fail
//! fast with `busy` instead of racing the provider. All provider calls
//! go through the circuit breaker.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ConnectorConfig;
use crate::connector::{CircuitBreaker, ConnectorProvider, ConnectorSession, SessionState};
use crate::error::{ConnectorError, StoreError};
use crate::ingest::{IngestPayload, IngestService};
use crate::metrics::Metrics;
use crate::queue::Broker;
use crate::store::MeetingStore;
use crate::trace::TraceContext;

#[derive(Debug, Clone, Serialize)]
pub struct JoinOutcome {
    pub session: ConnectorSession,
    /// True when an existing fresh session satisfied the join without a
    /// provider call.
    pub reused: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LivePullReport {
    pub pulled: usize,
    pub ingested: usize,
    pub invalid: usize,
    pub reconnected: bool,
}

struct OpLock {
    key: String,
    owner: String,
}

pub struct ConnectorManager {
    store: Arc<dyn MeetingStore>,
    broker: Arc<dyn Broker>,
    provider: Arc<dyn ConnectorProvider>,
    breaker: Arc<CircuitBreaker>,
    ingest: Arc<IngestService>,
    metrics: Arc<Metrics>,
    config: ConnectorConfig,
}

impl ConnectorManager {
    pub fn new(
        store: Arc<dyn MeetingStore>,
        broker: Arc<dyn Broker>,
        provider: Arc<dyn ConnectorProvider>,
        breaker: Arc<CircuitBreaker>,
        ingest: Arc<IngestService>,
        metrics: Arc<Metrics>,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            store,
            broker,
            provider,
            breaker,
            ingest,
            metrics,
            config,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    // --- Operation lock ---

    async fn acquire(&self, meeting_id: &str) -> Result<OpLock, ConnectorError> {
        let key = format!("connector-op:{}:{}", self.provider.name(), meeting_id);
        let owner = Uuid::new_v4().to_string();
        let acquired = self
            .broker
            .acquire_lock(&key, &owner, self.config.op_lock_ttl)
            .await
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))?;
        if !acquired {
            return Err(ConnectorError::Busy(meeting_id.to_string()));
        }
        Ok(OpLock { key, owner })
    }

    async fn release(&self, lock: OpLock) {
        if let Err(e) = self.broker.release_lock(&lock.key, &lock.owner).await {
            // The TTL will clean up after us.
            tracing::warn!(key = %lock.key, "failed to release op lock: {}", e);
        }
    }

    /// Run one provider call through the breaker, feeding the outcome
    /// back into it. Circuit-open short-circuits before the provider is
    /// touched and never counts as a provider failure.
    async fn guarded<T, F>(&self, call: F) -> Result<T, ConnectorError>
    where
        F: Future<Output = Result<T, ConnectorError>>,
    {
        self.breaker.allow().await?;
        match call.await {
            Ok(value) => {
                self.breaker.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.breaker
                    .record_failure(&e.to_string(), !e.is_retryable())
                    .await;
                Err(e)
            }
        }
    }

    // --- Public operations ---

    pub async fn join(&self, meeting_id: &str) -> Result<JoinOutcome, ConnectorError> {
        let lock = self.acquire(meeting_id).await?;
        let result = self.join_locked(meeting_id).await;
        self.release(lock).await;
        result
    }

    pub async fn leave(&self, meeting_id: &str) -> Result<(), ConnectorError> {
        let lock = self.acquire(meeting_id).await?;
        let result = self.leave_locked(meeting_id).await;
        self.release(lock).await;
        result
    }

    pub async fn reconnect(&self, meeting_id: &str) -> Result<ConnectorSession, ConnectorError> {
        let lock = self.acquire(meeting_id).await?;
        let result = self.reconnect_locked(meeting_id).await;
        self.release(lock).await;
        result
    }

    pub async fn live_pull(&self, meeting_id: &str) -> Result<LivePullReport, ConnectorError> {
        let lock = self.acquire(meeting_id).await?;
        let result = self.live_pull_locked(meeting_id).await;
        self.release(lock).await;
        result
    }

    /// Session view for one meeting. Guarded like the other lifecycle
    /// operations so a status read never races a transition in flight.
    pub async fn status(&self, meeting_id: &str) -> Result<Option<ConnectorSession>, ConnectorError> {
        let lock = self.acquire(meeting_id).await?;
        let result = self.session(meeting_id).await;
        self.release(lock).await;
        result
    }

    pub async fn sessions(&self) -> Result<Vec<ConnectorSession>, ConnectorError> {
        Ok(self.store.list_sessions(self.provider.name()).await?)
    }

    /// Provider-side session health probe; refreshes `last_seen`.
    pub async fn health(&self, meeting_id: &str) -> Result<(), ConnectorError> {
        let lock = self.acquire(meeting_id).await?;
        let result = self.health_locked(meeting_id).await;
        self.release(lock).await;
        result
    }

    // --- Locked bodies ---

    async fn session(
        &self,
        meeting_id: &str,
    ) -> Result<Option<ConnectorSession>, ConnectorError> {
        Ok(self
            .store
            .get_session(meeting_id, self.provider.name())
            .await?)
    }

    async fn health_locked(&self, meeting_id: &str) -> Result<(), ConnectorError> {
        let mut session = self
            .session(meeting_id)
            .await?
            .ok_or_else(|| ConnectorError::NoSession(meeting_id.to_string()))?;
        let provider_ref = session
            .provider_ref
            .clone()
            .ok_or_else(|| ConnectorError::BadState {
                state: session.state.to_string(),
                op: "health",
            })?;

        self.guarded(self.provider.health(&provider_ref)).await?;
        session.last_seen = Some(Utc::now());
        self.store.upsert_session(&session).await?;
        Ok(())
    }

    async fn join_locked(&self, meeting_id: &str) -> Result<JoinOutcome, ConnectorError> {
        let provider_name = self.provider.name().to_string();

        let prior = self.store.get_session(meeting_id, &provider_name).await?;
        if let Some(session) = &prior {
            if session.state == SessionState::Connected {
                let fresh = session.joined_at.is_some_and(|t| {
                    Utc::now()
                        .signed_duration_since(t)
                        .to_std()
                        .is_ok_and(|age| age < self.config.join_idempotent_ttl)
                });
                if fresh {
                    tracing::debug!(meeting_id, "idempotent join, reusing session");
                    return Ok(JoinOutcome {
                        session: session.clone(),
                        reused: true,
                    });
                }
            }
        }

        if self.store.get_meeting(meeting_id).await?.is_none() {
            return Err(ConnectorError::Store(StoreError::MeetingNotFound(
                meeting_id.to_string(),
            )));
        }

        let mut session = ConnectorSession::joining(meeting_id, &provider_name);
        self.store.upsert_session(&session).await?;

        match self.guarded(self.provider.join(meeting_id)).await {
            Ok(provider_ref) => {
                let now = Utc::now();
                session.state = SessionState::Connected;
                session.provider_ref = Some(provider_ref);
                session.joined_at = Some(now);
                session.last_seen = Some(now);
                session.consecutive_live_pull_failures = 0;
                session.last_error = None;
                self.store.upsert_session(&session).await?;
                self.store
                    .bind_connector(meeting_id, &provider_name)
                    .await?;
                tracing::info!(meeting_id, provider = %provider_name, "connector joined");
                Ok(JoinOutcome {
                    session,
                    reused: false,
                })
            }
            Err(e @ ConnectorError::CircuitOpen(_)) => {
                // The provider was never touched; put things back.
                match prior {
                    Some(previous) => self.store.upsert_session(&previous).await?,
                    None => self.store.delete_session(meeting_id, &provider_name).await?,
                }
                Err(e)
            }
            Err(e) => {
                session.state = SessionState::Dead;
                session.last_error = Some(e.to_string());
                self.store.upsert_session(&session).await?;
                tracing::warn!(meeting_id, "connector join failed: {}", e);
                Err(e)
            }
        }
    }

    async fn leave_locked(&self, meeting_id: &str) -> Result<(), ConnectorError> {
        let provider_name = self.provider.name().to_string();
        let mut session = self
            .store
            .get_session(meeting_id, &provider_name)
            .await?
            .ok_or_else(|| ConnectorError::NoSession(meeting_id.to_string()))?;

        match (session.state, session.provider_ref.clone()) {
            (SessionState::Connected | SessionState::Leaving, Some(provider_ref)) => {
                session.state = SessionState::Leaving;
                self.store.upsert_session(&session).await?;
                match self.guarded(self.provider.leave(&provider_ref)).await {
                    Ok(()) => {
                        self.store.delete_session(meeting_id, &provider_name).await?;
                        tracing::info!(meeting_id, "connector left");
                        Ok(())
                    }
                    Err(e) => {
                        session.last_error = Some(e.to_string());
                        self.store.upsert_session(&session).await?;
                        Err(e)
                    }
                }
            }
            // Disconnected, dead and half-born sessions have nothing to
            // tell the provider; dropping the record is the whole leave.
            _ => {
                self.store.delete_session(meeting_id, &provider_name).await?;
                Ok(())
            }
        }
    }

    async fn reconnect_locked(&self, meeting_id: &str) -> Result<ConnectorSession, ConnectorError> {
        let provider_name = self.provider.name().to_string();
        let mut session = self
            .store
            .get_session(meeting_id, &provider_name)
            .await?
            .ok_or_else(|| ConnectorError::NoSession(meeting_id.to_string()))?;

        if matches!(session.state, SessionState::Dead | SessionState::Leaving) {
            return Err(ConnectorError::BadState {
                state: session.state.to_string(),
                op: "reconnect",
            });
        }

        session.state = SessionState::Joining;
        self.store.upsert_session(&session).await?;

        match self.guarded(self.provider.join(meeting_id)).await {
            Ok(provider_ref) => {
                let now = Utc::now();
                session.state = SessionState::Connected;
                session.provider_ref = Some(provider_ref);
                session.joined_at = Some(now);
                session.last_seen = Some(now);
                session.consecutive_live_pull_failures = 0;
                session.last_error = None;
                self.store.upsert_session(&session).await?;
                tracing::info!(meeting_id, "connector reconnected");
                Ok(session)
            }
            Err(e @ ConnectorError::CircuitOpen(_)) => {
                session.state = SessionState::Disconnected;
                self.store.upsert_session(&session).await?;
                Err(e)
            }
            Err(e) => {
                session.state = SessionState::Dead;
                session.last_error = Some(e.to_string());
                self.store.upsert_session(&session).await?;
                tracing::warn!(meeting_id, "connector reconnect failed: {}", e);
                Err(e)
            }
        }
    }

    async fn live_pull_locked(&self, meeting_id: &str) -> Result<LivePullReport, ConnectorError> {
        let provider_name = self.provider.name().to_string();
        let mut session = self
            .store
            .get_session(meeting_id, &provider_name)
            .await?
            .ok_or_else(|| ConnectorError::NoSession(meeting_id.to_string()))?;

        if session.state != SessionState::Connected {
            return Err(ConnectorError::BadState {
                state: session.state.to_string(),
                op: "live_pull",
            });
        }
        let provider_ref = session
            .provider_ref
            .clone()
            .ok_or_else(|| ConnectorError::BadState {
                state: session.state.to_string(),
                op: "live_pull",
            })?;

        match self
            .guarded(
                self.provider
                    .fetch_chunks(&provider_ref, self.config.live_pull_batch_limit),
            )
            .await
        {
            Ok(chunks) => {
                let mut report = LivePullReport {
                    pulled: chunks.len(),
                    ..Default::default()
                };
                for chunk in chunks {
                    let Some(bytes) = chunk.decode() else {
                        report.invalid += 1;
                        self.metrics
                            .live_pull_invalid_chunks
                            .fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let trace = TraceContext::new_root();
                    match self
                        .ingest
                        .ingest_chunk(meeting_id, IngestPayload::Bytes(bytes), &trace)
                        .await
                    {
                        Ok(_) => report.ingested += 1,
                        Err(e) => {
                            report.invalid += 1;
                            self.metrics
                                .live_pull_invalid_chunks
                                .fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(meeting_id, "live-pull chunk rejected: {}", e);
                        }
                    }
                }
                session.last_seen = Some(Utc::now());
                session.consecutive_live_pull_failures = 0;
                self.store.upsert_session(&session).await?;
                Ok(report)
            }
            Err(e) => {
                session.consecutive_live_pull_failures += 1;
                session.last_error = Some(e.to_string());
                let failures = session.consecutive_live_pull_failures;

                if failures >= self.config.live_pull_fail_reconnect_threshold {
                    tracing::warn!(
                        meeting_id,
                        failures,
                        "live-pull failure threshold reached, forcing reconnect"
                    );
                    session.state = SessionState::Disconnected;
                    self.store.upsert_session(&session).await?;

                    session.state = SessionState::Joining;
                    self.store.upsert_session(&session).await?;
                    match self.guarded(self.provider.join(meeting_id)).await {
                        Ok(new_ref) => {
                            let now = Utc::now();
                            session.state = SessionState::Connected;
                            session.provider_ref = Some(new_ref);
                            session.joined_at = Some(now);
                            session.last_seen = Some(now);
                            session.consecutive_live_pull_failures = 0;
                            self.store.upsert_session(&session).await?;
                            tracing::info!(meeting_id, "forced reconnect succeeded");
                            // The pull itself yielded nothing, but the
                            // session is live again; report that rather
                            // than a bare error.
                            return Ok(LivePullReport {
                                reconnected: true,
                                ..Default::default()
                            });
                        }
                        Err(join_err) => {
                            session.state = SessionState::Disconnected;
                            session.last_error = Some(join_err.to_string());
                            self.store.upsert_session(&session).await?;
                            tracing::warn!(meeting_id, "forced reconnect failed: {}", join_err);
                        }
                    }
                } else {
                    self.store.upsert_session(&session).await?;
                }
                Err(e)
            }
        }
    }
}
