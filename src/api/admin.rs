//! Admin surface: observation and controlled mutation.
//!
//! Reads report queue depths, storage health, readiness, connector and
//! breaker state, and the audit trail. Writes go through the same locks
//! and state machines as normal traffic.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::blob::BlobStore;
use crate::connector::ConnectorManager;
use crate::engine::AppContext;
use crate::error::ConnectorError;
use crate::queue::{Broker, pipeline_queues};
use crate::store::MeetingStore;

/// Per-queue depths; a broken queue reports its error inline while the
/// rest still report numbers. The endpoint itself never fails.
pub async fn queues_health(
    State(ctx): State<Arc<AppContext>>,
) -> Json<serde_json::Value> {
    let mut queues = serde_json::Map::new();
    for queue in pipeline_queues() {
        let entry = match ctx.broker.depths(queue).await {
            Ok(depths) => json!({
                "depth": depths.ready,
                "pending": depths.pending,
                "dlq": depths.dlq,
            }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        queues.insert(queue.to_string(), entry);
    }
    Json(json!({ "queues": queues, "metrics": ctx.metrics.snapshot() }))
}

pub async fn storage_health(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let store = match ctx.store.ping().await {
        Ok(()) => json!({ "ok": true }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };
    let blob = match ctx.blob.probe().await {
        Ok(()) => json!({ "ok": true }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    };
    Json(json!({ "store": store, "blob": blob }))
}

pub async fn readiness(State(ctx): State<Arc<AppContext>>) -> Json<serde_json::Value> {
    let report = &ctx.readiness;
    Json(json!({ "ready": report.ready(), "issues": report.issues }))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
}

fn default_audit_limit() -> usize {
    100
}

pub async fn audit_trail(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = ctx.store.recent_audit(query.limit.min(1000)).await?;
    Ok(Json(json!({ "events": events })))
}

// --- DLQ ---

pub async fn dlq_list(
    State(ctx): State<Arc<AppContext>>,
    Path(queue): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = ctx.broker.dlq_list(&queue).await?;
    Ok(Json(json!({ "queue": queue, "entries": entries })))
}

pub async fn dlq_replay(
    State(ctx): State<Arc<AppContext>>,
    Path((queue, job_id)): Path<(String, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = ctx.broker.dlq_replay(&queue, job_id).await?;
    tracing::info!(queue = %queue, job_id = %job_id, "DLQ replay requested");
    Ok(Json(json!({
        "queue": queue,
        "job_id": job.job_id,
        "attempt": job.attempt,
        "trace_id": job.trace.trace_id,
    })))
}

// --- Connector ---

fn connector_for<'a>(
    ctx: &'a AppContext,
    provider: &str,
) -> Result<&'a Arc<ConnectorManager>, ApiError> {
    let connector = ctx.connector.as_ref().ok_or(ConnectorError::Disabled)?;
    if connector.provider_name() != provider {
        return Err(ApiError::not_found(
            "unknown_provider",
            format!("no connector provider {provider:?}"),
        ));
    }
    Ok(connector)
}

pub async fn connector_join(
    State(ctx): State<Arc<AppContext>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    let outcome = connector.join(&meeting_id).await?;
    Ok(Json(json!({ "session": outcome.session, "reused": outcome.reused })))
}

pub async fn connector_leave(
    State(ctx): State<Arc<AppContext>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    connector.leave(&meeting_id).await?;
    Ok(Json(json!({ "meeting_id": meeting_id, "left": true })))
}

pub async fn connector_reconnect(
    State(ctx): State<Arc<AppContext>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    let session = connector.reconnect(&meeting_id).await?;
    Ok(Json(json!({ "session": session })))
}

pub async fn connector_status(
    State(ctx): State<Arc<AppContext>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    let session = connector.status(&meeting_id).await?;
    Ok(Json(json!({ "meeting_id": meeting_id, "session": session })))
}

pub async fn connector_health(
    State(ctx): State<Arc<AppContext>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    connector.health(&meeting_id).await?;
    Ok(Json(json!({ "meeting_id": meeting_id, "healthy": true })))
}

pub async fn connector_live_pull(
    State(ctx): State<Arc<AppContext>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    let report = connector.live_pull(&meeting_id).await?;
    Ok(Json(json!({ "meeting_id": meeting_id, "report": report })))
}

pub async fn connector_sessions(
    State(ctx): State<Arc<AppContext>>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    let sessions = connector.sessions().await?;
    Ok(Json(json!({ "provider": provider, "sessions": sessions })))
}

pub async fn breaker_state(
    State(ctx): State<Arc<AppContext>>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    Ok(Json(json!(connector.breaker().snapshot().await)))
}

#[derive(Debug, Deserialize, Default)]
pub struct BreakerResetBody {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn breaker_reset(
    State(ctx): State<Arc<AppContext>>,
    Path(provider): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let connector = connector_for(&ctx, &provider)?;
    let reason = serde_json::from_slice::<BreakerResetBody>(&body)
        .ok()
        .and_then(|b| b.reason)
        .unwrap_or_else(|| "manual reset".to_string());
    connector.breaker().reset("admin", &reason).await;
    Ok(Json(json!(connector.breaker().snapshot().await)))
}

pub async fn reconcile_now(
    State(ctx): State<Arc<AppContext>>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let _ = connector_for(&ctx, &provider)?;
    let report = ctx.reconciler.run_once().await;
    Ok(Json(json!({ "report": report })))
}
