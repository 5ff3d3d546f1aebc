//! Meeting-facing endpoints: start, ingest, read, finalize, rebuild.

use std::sync::Arc;

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::error::ApiError;
use crate::api::guard::ensure_tenant;
use crate::auth::AuthContext;
use crate::engine::AppContext;
use crate::ingest::{IngestPayload, StartMeeting};
use crate::store::{ArtifactKind, Meeting, MeetingMode, MeetingStore};
use crate::trace::TraceContext;

#[derive(Debug, Deserialize)]
pub struct StartMeetingBody {
    #[serde(default)]
    pub meeting_id: Option<String>,
    #[serde(default)]
    pub mode: Option<MeetingMode>,
    #[serde(default)]
    pub delivery_recipient: Option<String>,
    /// Override the connector auto-join default for realtime meetings.
    #[serde(default)]
    pub auto_join_connector: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StartMeetingResponse {
    pub meeting_id: String,
    pub mode: MeetingMode,
    pub connector_auto_join: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_provider: Option<String>,
    pub connector_connected: bool,
}

pub async fn start_meeting(
    State(ctx): State<Arc<AppContext>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<StartMeetingBody>,
) -> Result<Json<StartMeetingResponse>, ApiError> {
    let mode = body.mode.unwrap_or(MeetingMode::Batch);
    let meeting = ctx
        .ingest
        .start_meeting(StartMeeting {
            meeting_id: body.meeting_id,
            mode,
            tenant: auth.tenant.clone(),
            delivery_recipient: body.delivery_recipient,
        })
        .await?;

    let auto_join = mode == MeetingMode::Realtime
        && ctx.connector.is_some()
        && body.auto_join_connector.unwrap_or(true);

    let mut connected = false;
    let mut provider = None;
    if auto_join {
        let connector = ctx.connector.as_ref().ok_or(ApiError::from(
            crate::error::ConnectorError::Disabled,
        ))?;
        provider = Some(connector.provider_name().to_string());
        match connector.join(&meeting.meeting_id).await {
            Ok(_) => connected = true,
            Err(e) => {
                // The meeting exists either way; the connector can be
                // joined later through the admin surface.
                tracing::warn!(
                    meeting_id = %meeting.meeting_id,
                    "connector auto-join failed: {}", e
                );
            }
        }
    }

    Ok(Json(StartMeetingResponse {
        meeting_id: meeting.meeting_id,
        mode,
        connector_auto_join: auto_join,
        connector_provider: provider,
        connector_connected: connected,
    }))
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    #[serde(default)]
    media_b64: Option<String>,
    #[serde(default)]
    blob_ref: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkResponse {
    pub chunk_seq: u64,
}

/// Shared by the user route and the service-only internal variant;
/// the contour guards differ, the body handling does not.
pub async fn post_chunk(
    State(ctx): State<Arc<AppContext>>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
    request: Request,
) -> Result<Json<ChunkResponse>, ApiError> {
    let meeting = load_meeting(&ctx, &meeting_id).await?;
    ensure_tenant(&ctx, &auth, meeting.tenant.as_deref())?;

    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let payload = if content_type.starts_with("multipart/") {
        let mut multipart = Multipart::from_request(request, &ctx)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        let mut media = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?
        {
            if field.name() == Some("media") {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(e.to_string()))?;
                media = Some(bytes.to_vec());
            }
        }
        let media =
            media.ok_or_else(|| ApiError::bad_request("multipart body has no `media` part"))?;
        IngestPayload::Bytes(media)
    } else {
        let Json(body) = Json::<ChunkBody>::from_request(request, &ctx)
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        match (body.media_b64, body.blob_ref) {
            (Some(b64), _) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(b64.as_bytes())
                    .map_err(|e| ApiError::bad_request(format!("bad media_b64: {e}")))?;
                IngestPayload::Bytes(bytes)
            }
            (None, Some(blob_ref)) => IngestPayload::BlobRef(blob_ref),
            (None, None) => {
                return Err(ApiError::bad_request(
                    "chunk body needs media_b64 or blob_ref",
                ));
            }
        }
    };

    let outcome = ctx.ingest.ingest_chunk(&meeting_id, payload, &trace).await?;
    Ok(Json(ChunkResponse {
        chunk_seq: outcome.chunk_seq,
    }))
}

pub async fn get_meeting(
    State(ctx): State<Arc<AppContext>>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let meeting = load_meeting(&ctx, &meeting_id).await?;
    ensure_tenant(&ctx, &auth, meeting.tenant.as_deref())?;

    let enhanced = ctx
        .store
        .get_artifact(&meeting_id, ArtifactKind::EnhancedTranscript)
        .await?;
    let report = ctx.store.get_artifact(&meeting_id, ArtifactKind::Report).await?;

    Ok(Json(json!({
        "meeting_id": meeting.meeting_id,
        "mode": meeting.mode,
        "status": meeting.status,
        "created_at": meeting.created_at,
        "finalized": meeting.finalized_at.is_some(),
        "epoch": meeting.epoch,
        "connector_provider": meeting.connector_provider,
        "enhanced_transcript": enhanced.map(|a| a.data["text"].clone()),
        "report": report.map(|a| a.data),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub kind: String,
    #[serde(default)]
    pub fmt: Option<String>,
}

pub async fn get_artifact(
    State(ctx): State<Arc<AppContext>>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ArtifactQuery>,
) -> Result<Response, ApiError> {
    let meeting = load_meeting(&ctx, &meeting_id).await?;
    ensure_tenant(&ctx, &auth, meeting.tenant.as_deref())?;

    let kind: ArtifactKind = query
        .kind
        .parse()
        .map_err(|e: String| ApiError::bad_request(e))?;
    let artifact = ctx
        .store
        .get_artifact(&meeting_id, kind)
        .await?
        .ok_or_else(|| {
            ApiError::not_found("artifact_missing", format!("no {kind} artifact for {meeting_id}"))
        })?;

    let response = match query.fmt.as_deref() {
        Some("text") | Some("txt") | Some("md") => {
            let text = artifact.data["text"]
                .as_str()
                .or_else(|| artifact.data["summary"].as_str())
                .map(str::to_string)
                .unwrap_or_else(|| artifact.data.to_string());
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
        }
        None | Some("json") => {
            let bytes = serde_json::to_vec_pretty(&artifact.data)
                .map_err(|e| ApiError::bad_request(e.to_string()))?;
            ([(header::CONTENT_TYPE, "application/json")], bytes).into_response()
        }
        Some(other) => {
            return Err(ApiError::bad_request(format!("unknown fmt {other:?}")));
        }
    };
    Ok(response)
}

pub async fn finalize(
    State(ctx): State<Arc<AppContext>>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let meeting = load_meeting(&ctx, &meeting_id).await?;
    ensure_tenant(&ctx, &auth, meeting.tenant.as_deref())?;

    ctx.ingest.finalize_meeting(&meeting_id, &trace).await?;
    let meeting = load_meeting(&ctx, &meeting_id).await?;
    Ok(Json(json!({ "meeting_id": meeting_id, "status": meeting.status })))
}

pub async fn rebuild(
    State(ctx): State<Arc<AppContext>>,
    Path(meeting_id): Path<String>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let meeting = load_meeting(&ctx, &meeting_id).await?;
    ensure_tenant(&ctx, &auth, meeting.tenant.as_deref())?;

    let jobs = ctx.ingest.rebuild(&meeting_id, &trace).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "meeting_id": meeting_id, "jobs": jobs })),
    ))
}

async fn load_meeting(ctx: &AppContext, meeting_id: &str) -> Result<Meeting, ApiError> {
    ctx.store
        .get_meeting(meeting_id)
        .await?
        .ok_or_else(|| ApiError::not_found("meeting_not_found", format!("no meeting {meeting_id}")))
}
