//! Stage implementations shared by workers and inline mode.
//!
//! Every stage derives an idempotency key from
//! `(meeting_id, step, payload, epoch)` and consults the idempotency
//! store before producing side effects; a re-delivered job returns the
//! recorded result without touching providers again.

use std::sync::Arc;

use serde_json::json;

use crate::blob::BlobStore;
use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::providers::{
    Attachment, DeliveryRequest, DeliverySink, ReportBuilder, SttEngine, TranscriptEnhancer,
};
use crate::queue::{PipelineStep, idempotency_key};
use crate::store::{ArtifactKind, Meeting, MeetingStatus, MeetingStore};

#[derive(Debug, Clone)]
pub struct SttOutcome {
    /// Transcribed text for this chunk.
    pub text: String,
    /// Segment count in the raw transcript after the merge.
    pub segments: u64,
}

pub struct Stages {
    store: Arc<dyn MeetingStore>,
    blob: Arc<dyn BlobStore>,
    stt: Arc<dyn SttEngine>,
    enhancer: Arc<dyn TranscriptEnhancer>,
    analytics: Arc<dyn ReportBuilder>,
    delivery: Arc<dyn DeliverySink>,
    metrics: Arc<Metrics>,
    default_recipient: Option<String>,
}

impl Stages {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MeetingStore>,
        blob: Arc<dyn BlobStore>,
        stt: Arc<dyn SttEngine>,
        enhancer: Arc<dyn TranscriptEnhancer>,
        analytics: Arc<dyn ReportBuilder>,
        delivery: Arc<dyn DeliverySink>,
        metrics: Arc<Metrics>,
        default_recipient: Option<String>,
    ) -> Self {
        Self {
            store,
            blob,
            stt,
            enhancer,
            analytics,
            delivery,
            metrics,
            default_recipient,
        }
    }

    pub async fn meeting(&self, meeting_id: &str) -> Result<Meeting, PipelineError> {
        self.store
            .get_meeting(meeting_id)
            .await?
            .ok_or_else(|| PipelineError::MeetingNotFound(meeting_id.to_string()))
    }

    /// Transcribe one chunk and merge it into the raw transcript.
    pub async fn run_stt(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
    ) -> Result<SttOutcome, PipelineError> {
        let meeting = self.meeting(meeting_id).await?;
        let key = idempotency_key(
            meeting_id,
            PipelineStep::Stt,
            &json!({ "chunk_seq": chunk_seq }),
            meeting.epoch,
        );
        if let Some(prev) = self.store.idempotency_get(&key).await? {
            tracing::debug!(meeting_id, chunk_seq, "stt re-delivery, returning prior result");
            return Ok(SttOutcome {
                text: prev["text"].as_str().unwrap_or_default().to_string(),
                segments: prev["segments"].as_u64().unwrap_or_default(),
            });
        }

        let chunk = self
            .store
            .get_chunk(meeting_id, chunk_seq)
            .await?
            .ok_or_else(|| {
                PipelineError::InvalidPayload(format!(
                    "chunk {chunk_seq} of meeting {meeting_id} does not exist"
                ))
            })?;
        let media = self.blob.get(&chunk.media_ref).await?;
        let text = self.stt.transcribe(&media).await?;
        let segments = self
            .store
            .merge_transcript_segment(meeting_id, chunk_seq, &text)
            .await?;

        self.store
            .idempotency_put(&key, &json!({ "text": text, "segments": segments }))
            .await?;
        Ok(SttOutcome { text, segments })
    }

    /// Whether every persisted chunk has been transcribed and the
    /// meeting is finalized; the signal that unlocks the enhancer.
    pub async fn transcript_complete(&self, meeting: &Meeting) -> Result<bool, PipelineError> {
        if meeting.finalized_at.is_none() {
            return Ok(false);
        }
        let chunks = self.store.chunk_count(&meeting.meeting_id).await?;
        let segments = match self
            .store
            .get_artifact(&meeting.meeting_id, ArtifactKind::RawTranscript)
            .await?
        {
            Some(artifact) => artifact.data["segments"]
                .as_object()
                .map(|o| o.len() as u64)
                .unwrap_or_default(),
            None => 0,
        };
        Ok(chunks == segments)
    }

    /// Rewrite the raw transcript into the enhanced one.
    pub async fn run_enhance(&self, meeting_id: &str) -> Result<(), PipelineError> {
        let meeting = self.meeting(meeting_id).await?;
        let key = idempotency_key(meeting_id, PipelineStep::Enhance, &json!({}), meeting.epoch);
        if self.store.idempotency_get(&key).await?.is_some() {
            tracing::debug!(meeting_id, "enhance re-delivery, skipping");
            return Ok(());
        }

        let raw_text = match self
            .store
            .get_artifact(meeting_id, ArtifactKind::RawTranscript)
            .await?
        {
            Some(artifact) => assemble_raw_text(&artifact.data),
            None => String::new(),
        };

        let enhanced = self.enhancer.enhance(&raw_text).await?;
        self.store
            .put_artifact(
                meeting_id,
                ArtifactKind::EnhancedTranscript,
                &json!({ "text": enhanced }),
            )
            .await?;
        self.store.idempotency_put(&key, &json!({ "ok": true })).await?;
        Ok(())
    }

    /// Build the report and scorecard. Returns whether a delivery
    /// should follow.
    pub async fn run_analytics(&self, meeting_id: &str) -> Result<bool, PipelineError> {
        let meeting = self.meeting(meeting_id).await?;
        let key = idempotency_key(meeting_id, PipelineStep::Analytics, &json!({}), meeting.epoch);
        if let Some(prev) = self.store.idempotency_get(&key).await? {
            return Ok(prev["deliver"].as_bool().unwrap_or(false));
        }

        let enhanced = self
            .store
            .get_artifact(meeting_id, ArtifactKind::EnhancedTranscript)
            .await?
            .ok_or_else(|| PipelineError::ArtifactMissing {
                meeting_id: meeting_id.to_string(),
                kind: ArtifactKind::EnhancedTranscript.to_string(),
            })?;
        let text = enhanced.data["text"].as_str().unwrap_or_default();

        let output = self.analytics.build(text).await?;
        self.store
            .put_artifact(meeting_id, ArtifactKind::Report, &output.report)
            .await?;
        self.store
            .put_artifact(meeting_id, ArtifactKind::Scorecard, &output.scorecard)
            .await?;

        let deliver = self.recipient(&meeting).is_some();
        self.store
            .idempotency_put(&key, &json!({ "deliver": deliver }))
            .await?;
        Ok(deliver)
    }

    /// Send the report through the delivery sink.
    pub async fn run_delivery(&self, meeting_id: &str) -> Result<(), PipelineError> {
        let meeting = self.meeting(meeting_id).await?;
        let Some(recipient) = self.recipient(&meeting) else {
            tracing::debug!(meeting_id, "no delivery recipient configured, skipping");
            return Ok(());
        };

        let key = idempotency_key(meeting_id, PipelineStep::Delivery, &json!({}), meeting.epoch);
        if self.store.idempotency_get(&key).await?.is_some() {
            tracing::debug!(meeting_id, "delivery re-delivery, skipping");
            return Ok(());
        }

        let report = self
            .store
            .get_artifact(meeting_id, ArtifactKind::Report)
            .await?
            .ok_or_else(|| PipelineError::ArtifactMissing {
                meeting_id: meeting_id.to_string(),
                kind: ArtifactKind::Report.to_string(),
            })?;
        let scorecard = self
            .store
            .get_artifact(meeting_id, ArtifactKind::Scorecard)
            .await?;

        let body = report.data["summary"].as_str().unwrap_or_default().to_string();
        let mut attachments = vec![Attachment {
            name: "report.json".to_string(),
            content: report.data.clone(),
        }];
        if let Some(scorecard) = scorecard {
            attachments.push(Attachment {
                name: "scorecard.json".to_string(),
                content: scorecard.data,
            });
        }

        self.delivery
            .send(&DeliveryRequest {
                recipient,
                subject: format!("Meeting report: {meeting_id}"),
                body,
                attachments,
            })
            .await?;
        self.store.idempotency_put(&key, &json!({ "ok": true })).await?;
        Ok(())
    }

    pub fn recipient(&self, meeting: &Meeting) -> Option<String> {
        meeting
            .delivery_recipient
            .clone()
            .or_else(|| self.default_recipient.clone())
    }

    pub async fn mark_done(&self, meeting_id: &str) -> Result<(), PipelineError> {
        self.store
            .set_status(meeting_id, MeetingStatus::Done, false)
            .await?;
        Ok(())
    }

    /// Best-effort failure marker used on non-retryable stage errors.
    pub async fn mark_failed(&self, meeting_id: &str) {
        if let Err(e) = self
            .store
            .set_status(meeting_id, MeetingStatus::Failed, false)
            .await
        {
            tracing::warn!(meeting_id, "could not mark meeting failed: {}", e);
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<dyn MeetingStore> {
        &self.store
    }
}

/// Join transcript segments in chunk-seq order.
pub(crate) fn assemble_raw_text(data: &serde_json::Value) -> String {
    let Some(segments) = data["segments"].as_object() else {
        return String::new();
    };
    let mut ordered: Vec<(u64, &str)> = segments
        .iter()
        .filter_map(|(k, v)| Some((k.parse().ok()?, v.as_str()?)))
        .collect();
    ordered.sort_by_key(|(seq, _)| *seq);
    ordered
        .into_iter()
        .map(|(_, text)| text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
