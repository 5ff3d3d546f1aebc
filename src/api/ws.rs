//! WebSocket contours.
//!
//! `/v1/ws` (user credentials) and `/v1/ws/internal` (service
//! credentials) speak the same frame protocol; only the guard differs.
//! Clients send `chunk` and `finalize` frames; the server acks every
//! chunk and, in inline mode, streams transcript updates and the final
//! report back over the socket.
//!
//! Sequence numbers are assigned at ingest: the `ack` carries the
//! server-assigned `chunk_seq` (the same value the HTTP chunk endpoint
//! returns and `transcript.update.seq_high` uses), not the client's
//! frame counter.

use std::sync::Arc;

use axum::Extension;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::api::guard::ensure_tenant;
use crate::auth::AuthContext;
use crate::engine::AppContext;
use crate::ingest::IngestPayload;
use crate::store::{ArtifactKind, MeetingStore};
use crate::trace::TraceContext;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub meeting_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Chunk { seq: u64, media_b64: String },
    Finalize,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerFrame {
    #[serde(rename = "ack")]
    Ack { seq: u64 },
    #[serde(rename = "transcript.update")]
    TranscriptUpdate { text: String, seq_high: u64 },
    #[serde(rename = "report")]
    Report { report: serde_json::Value },
    #[serde(rename = "error")]
    Error { code: String, reason: String },
}

pub async fn websocket(
    State(ctx): State<Arc<AppContext>>,
    Extension(auth): Extension<AuthContext>,
    Extension(trace): Extension<TraceContext>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| drive_session(socket, ctx, auth, trace, query.meeting_id))
}

async fn drive_session(
    mut socket: WebSocket,
    ctx: Arc<AppContext>,
    auth: AuthContext,
    trace: TraceContext,
    meeting_id: String,
) {
    tracing::debug!(meeting_id = %meeting_id, trace_id = %trace.trace_id, "ws session open");

    // The meeting must exist and belong to the caller before any frame
    // is processed.
    match ctx.store.get_meeting(&meeting_id).await {
        Ok(Some(meeting)) => {
            if ensure_tenant(&ctx, &auth, meeting.tenant.as_deref()).is_err() {
                let _ = send(&mut socket, &deny("tenant_denied", "meeting belongs to another tenant")).await;
                return;
            }
        }
        Ok(None) => {
            let _ = send(
                &mut socket,
                &deny("meeting_not_found", &format!("no meeting {meeting_id}")),
            )
            .await;
            return;
        }
        Err(e) => {
            let _ = send(&mut socket, &deny("store_unavailable", &e.to_string())).await;
            return;
        }
    }

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(meeting_id = %meeting_id, "ws receive error: {}", e);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = send(
                            &mut socket,
                            &deny("bad_frame", &format!("unparseable frame: {e}")),
                        )
                        .await;
                        continue;
                    }
                };
                if handle_frame(&mut socket, &ctx, &trace, &meeting_id, frame).await {
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the stack; binary frames are not
            // part of the protocol.
            _ => {}
        }
    }

    tracing::debug!(meeting_id = %meeting_id, "ws session closed");
}

/// Returns true when the session should end.
async fn handle_frame(
    socket: &mut WebSocket,
    ctx: &AppContext,
    trace: &TraceContext,
    meeting_id: &str,
    frame: ClientFrame,
) -> bool {
    match frame {
        ClientFrame::Chunk { seq, media_b64 } => {
            let bytes = match base64::engine::general_purpose::STANDARD.decode(media_b64.as_bytes())
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = send(socket, &deny("bad_media", &format!("media_b64: {e}"))).await;
                    return false;
                }
            };

            match ctx
                .ingest
                .ingest_chunk(meeting_id, IngestPayload::Bytes(bytes), trace)
                .await
            {
                Ok(outcome) => {
                    if seq != outcome.chunk_seq {
                        tracing::debug!(
                            meeting_id,
                            client_seq = seq,
                            chunk_seq = outcome.chunk_seq,
                            "client frame seq diverges from assigned chunk seq"
                        );
                    }
                    let _ = send(socket, &ServerFrame::Ack { seq: outcome.chunk_seq }).await;
                    if let Some(stt) = outcome.stt {
                        let _ = send(
                            socket,
                            &ServerFrame::TranscriptUpdate {
                                text: stt.text,
                                seq_high: outcome.chunk_seq,
                            },
                        )
                        .await;
                    }
                    false
                }
                Err(e) => {
                    let api: crate::api::error::ApiError = e.into();
                    let _ = send(socket, &deny(&api.code, &api.reason)).await;
                    false
                }
            }
        }
        ClientFrame::Finalize => {
            match ctx.ingest.finalize_meeting(meeting_id, trace).await {
                Ok(()) => {
                    // Inline mode has the report ready right now; queued
                    // mode clients poll the meeting endpoint instead.
                    if let Ok(Some(report)) =
                        ctx.store.get_artifact(meeting_id, ArtifactKind::Report).await
                    {
                        let _ = send(socket, &ServerFrame::Report { report: report.data }).await;
                    }
                }
                Err(e) => {
                    let api: crate::api::error::ApiError = e.into();
                    let _ = send(socket, &deny(&api.code, &api.reason)).await;
                }
            }
            true
        }
    }
}

fn deny(code: &str, reason: &str) -> ServerFrame {
    ServerFrame::Error {
        code: code.to_string(),
        reason: reason.to_string(),
    }
}

async fn send(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| {
        r#"{"type":"error","code":"internal","reason":"frame encoding failed"}"#.to_string()
    });
    socket.send(Message::Text(text.into())).await
}
