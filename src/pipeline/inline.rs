//! Inline execution mode.
//!
//! With `QUEUE_MODE=inline` the ingest facade runs every stage
//! synchronously in the request path, skipping the broker entirely.
//! Failures surface straight to the caller and nothing retries. Exists
//! for local development and single-process deployments; artifacts come
//! out identical to the queued path because both call [`Stages`].

use std::sync::Arc;

use crate::error::PipelineError;
use crate::pipeline::{Stages, SttOutcome};
use crate::store::{MeetingStatus, MeetingStore};

pub struct InlinePipeline {
    stages: Arc<Stages>,
}

impl InlinePipeline {
    pub fn new(stages: Arc<Stages>) -> Self {
        Self { stages }
    }

    /// Transcribe a freshly ingested chunk right away.
    pub async fn on_chunk(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
    ) -> Result<SttOutcome, PipelineError> {
        self.stages.run_stt(meeting_id, chunk_seq).await
    }

    /// Run the rest of the pipeline to completion.
    pub async fn finalize(&self, meeting_id: &str) -> Result<(), PipelineError> {
        match self.drive(meeting_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !e.is_retryable() {
                    self.stages.mark_failed(meeting_id).await;
                }
                Err(e)
            }
        }
    }

    /// Re-run the pipeline from the enhancer downstream (rebuild path).
    pub async fn rerun_from_enhance(&self, meeting_id: &str) -> Result<(), PipelineError> {
        self.finalize(meeting_id).await
    }

    async fn drive(&self, meeting_id: &str) -> Result<(), PipelineError> {
        self.stages.run_enhance(meeting_id).await?;
        let deliver = self.stages.run_analytics(meeting_id).await?;
        if deliver {
            self.stages.run_delivery(meeting_id).await?;
        }
        self.stages
            .store()
            .set_status(meeting_id, MeetingStatus::Done, false)
            .await?;
        Ok(())
    }
}
