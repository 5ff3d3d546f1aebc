//! Ingest facade: the single normalization path for chunks.
//!
//! HTTP posts, WebSocket frames and connector live-pull all land here:
//! assign a `chunk_seq`, persist the payload through the blob store,
//! record the chunk, then either enqueue the STT job or run the inline
//! pipeline in place. Nothing else in the system writes chunks.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::pipeline::{InlinePipeline, QueueDispatcher, Stages, SttOutcome};
use crate::queue::PipelineStep;
use crate::store::{ArtifactKind, ChunkRecord, Meeting, MeetingMode, MeetingStatus, MeetingStore};
use crate::trace::TraceContext;

/// How the chunk media arrives.
pub enum IngestPayload {
    /// Raw bytes to be written to blob storage.
    Bytes(Vec<u8>),
    /// The payload is already in blob storage under this reference.
    BlobRef(String),
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub chunk_seq: u64,
    /// Present in inline mode, where STT runs in the request path.
    pub stt: Option<SttOutcome>,
}

#[derive(Debug, Clone)]
pub struct StartMeeting {
    pub meeting_id: Option<String>,
    pub mode: MeetingMode,
    pub tenant: Option<String>,
    pub delivery_recipient: Option<String>,
}

/// Stage execution strategy, fixed at startup by `QUEUE_MODE`.
pub enum Dispatch {
    Inline(Arc<InlinePipeline>),
    Queued(QueueDispatcher),
}

pub struct IngestService {
    store: Arc<dyn MeetingStore>,
    blob: Arc<dyn BlobStore>,
    stages: Arc<Stages>,
    metrics: Arc<Metrics>,
    dispatch: Dispatch,
}

impl IngestService {
    pub fn new(
        store: Arc<dyn MeetingStore>,
        blob: Arc<dyn BlobStore>,
        stages: Arc<Stages>,
        metrics: Arc<Metrics>,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            store,
            blob,
            stages,
            metrics,
            dispatch,
        }
    }

    pub async fn start_meeting(&self, spec: StartMeeting) -> Result<Meeting, PipelineError> {
        let meeting_id = spec
            .meeting_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut meeting = Meeting::new(meeting_id, spec.mode, spec.tenant);
        meeting.delivery_recipient = spec.delivery_recipient;
        self.store.create_meeting(&meeting).await?;
        tracing::info!(
            meeting_id = %meeting.meeting_id,
            mode = %meeting.mode,
            "meeting started"
        );
        Ok(meeting)
    }

    /// Normalize one chunk into the pipeline.
    pub async fn ingest_chunk(
        &self,
        meeting_id: &str,
        payload: IngestPayload,
        trace: &TraceContext,
    ) -> Result<IngestOutcome, PipelineError> {
        let meeting = self
            .store
            .get_meeting(meeting_id)
            .await?
            .ok_or_else(|| PipelineError::MeetingNotFound(meeting_id.to_string()))?;

        if meeting.finalized_at.is_some()
            || !matches!(
                meeting.status,
                MeetingStatus::Created | MeetingStatus::Ingesting
            )
        {
            return Err(PipelineError::InvalidPayload(format!(
                "meeting {meeting_id} no longer accepts chunks (status {})",
                meeting.status
            )));
        }

        let chunk_seq = self.store.allocate_chunk_seq(meeting_id).await?;
        let media_ref = match payload {
            IngestPayload::Bytes(bytes) => self.blob.put(meeting_id, chunk_seq, &bytes).await?,
            IngestPayload::BlobRef(media_ref) => media_ref,
        };

        self.store
            .insert_chunk(&ChunkRecord {
                meeting_id: meeting_id.to_string(),
                chunk_seq,
                media_ref,
                received_at: chrono::Utc::now(),
                trace: trace.clone(),
            })
            .await?;

        if meeting.status == MeetingStatus::Created {
            self.store
                .set_status(meeting_id, MeetingStatus::Ingesting, false)
                .await?;
        }
        self.metrics
            .chunks_ingested
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let stt = match &self.dispatch {
            Dispatch::Inline(pipeline) => Some(pipeline.on_chunk(meeting_id, chunk_seq).await?),
            Dispatch::Queued(dispatcher) => {
                dispatcher
                    .enqueue(
                        meeting_id,
                        PipelineStep::Stt,
                        json!({ "chunk_seq": chunk_seq }),
                        trace.child(),
                    )
                    .await?;
                None
            }
        };

        Ok(IngestOutcome { chunk_seq, stt })
    }

    /// Explicit finalize signal. Idempotent: a second call is a no-op.
    pub async fn finalize_meeting(
        &self,
        meeting_id: &str,
        trace: &TraceContext,
    ) -> Result<(), PipelineError> {
        let meeting = self
            .store
            .get_meeting(meeting_id)
            .await?
            .ok_or_else(|| PipelineError::MeetingNotFound(meeting_id.to_string()))?;

        if meeting.finalized_at.is_some() {
            return Ok(());
        }
        self.store.set_finalized(meeting_id).await?;
        self.store
            .set_status(meeting_id, MeetingStatus::Processing, false)
            .await?;

        match &self.dispatch {
            Dispatch::Inline(pipeline) => pipeline.finalize(meeting_id).await?,
            Dispatch::Queued(dispatcher) => {
                // If every chunk is already transcribed the enhancer can
                // start now; otherwise the last STT job unlocks it.
                let meeting = self.stages.meeting(meeting_id).await?;
                if self.stages.transcript_complete(&meeting).await? {
                    dispatcher
                        .enqueue(meeting_id, PipelineStep::Enhance, json!({}), trace.child())
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Re-run the pipeline from the enhancer downstream under a fresh
    /// epoch. Returns the enqueued job ids (empty in inline mode).
    pub async fn rebuild(
        &self,
        meeting_id: &str,
        trace: &TraceContext,
    ) -> Result<Vec<Uuid>, PipelineError> {
        let _ = self
            .store
            .get_meeting(meeting_id)
            .await?
            .ok_or_else(|| PipelineError::MeetingNotFound(meeting_id.to_string()))?;

        let epoch = self.store.bump_epoch(meeting_id).await?;
        self.store
            .clear_artifacts(meeting_id, &ArtifactKind::DOWNSTREAM_OF_STT)
            .await?;
        self.store
            .set_status(meeting_id, MeetingStatus::Processing, true)
            .await?;
        tracing::info!(meeting_id, epoch, "rebuild requested");

        match &self.dispatch {
            Dispatch::Inline(pipeline) => {
                pipeline.rerun_from_enhance(meeting_id).await?;
                Ok(Vec::new())
            }
            Dispatch::Queued(dispatcher) => {
                let job_id = dispatcher
                    .enqueue(meeting_id, PipelineStep::Enhance, json!({}), trace.child())
                    .await?;
                Ok(vec![job_id])
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn MeetingStore> {
        &self.store
    }
}
