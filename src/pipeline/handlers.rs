//! Queue-backed stage handlers.
//!
//! Thin shells over [`Stages`]: decode the payload, run the stage, chain
//! the next one. A non-retryable failure marks the meeting failed before
//! the worker routes the job to the DLQ.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::PipelineError;
use crate::pipeline::{QueueDispatcher, Stages};
use crate::queue::{JobContext, JobEnvelope, JobHandler, PipelineStep};

async fn settle<T>(
    stages: &Stages,
    meeting_id: &str,
    result: Result<T, PipelineError>,
) -> Result<T, PipelineError> {
    if let Err(e) = &result {
        if !e.is_retryable() {
            stages.mark_failed(meeting_id).await;
        }
    }
    result
}

pub struct SttHandler {
    stages: Arc<Stages>,
    dispatcher: QueueDispatcher,
}

impl SttHandler {
    pub fn new(stages: Arc<Stages>, dispatcher: QueueDispatcher) -> Self {
        Self { stages, dispatcher }
    }
}

#[async_trait]
impl JobHandler for SttHandler {
    fn name(&self) -> &'static str {
        "stt"
    }

    async fn handle(&self, _ctx: &JobContext, job: &JobEnvelope) -> Result<(), PipelineError> {
        let chunk_seq = job.payload["chunk_seq"].as_u64().ok_or_else(|| {
            PipelineError::InvalidPayload("stt job payload missing chunk_seq".to_string())
        })?;

        let result = self.stages.run_stt(&job.meeting_id, chunk_seq).await;
        settle(&self.stages, &job.meeting_id, result).await?;

        // The last transcribed chunk of a finalized meeting unlocks the
        // enhancer. Duplicate unlocks are harmless: the enhance stage is
        // idempotent per epoch.
        let meeting = self.stages.meeting(&job.meeting_id).await?;
        if self.stages.transcript_complete(&meeting).await? {
            self.dispatcher
                .enqueue(
                    &job.meeting_id,
                    PipelineStep::Enhance,
                    json!({}),
                    job.trace.child(),
                )
                .await?;
        }
        Ok(())
    }
}

pub struct EnhanceHandler {
    stages: Arc<Stages>,
    dispatcher: QueueDispatcher,
}

impl EnhanceHandler {
    pub fn new(stages: Arc<Stages>, dispatcher: QueueDispatcher) -> Self {
        Self { stages, dispatcher }
    }
}

#[async_trait]
impl JobHandler for EnhanceHandler {
    fn name(&self) -> &'static str {
        "enhance"
    }

    async fn handle(&self, _ctx: &JobContext, job: &JobEnvelope) -> Result<(), PipelineError> {
        let result = self.stages.run_enhance(&job.meeting_id).await;
        settle(&self.stages, &job.meeting_id, result).await?;

        self.dispatcher
            .enqueue(
                &job.meeting_id,
                PipelineStep::Analytics,
                json!({}),
                job.trace.child(),
            )
            .await?;
        Ok(())
    }
}

pub struct AnalyticsHandler {
    stages: Arc<Stages>,
    dispatcher: QueueDispatcher,
}

impl AnalyticsHandler {
    pub fn new(stages: Arc<Stages>, dispatcher: QueueDispatcher) -> Self {
        Self { stages, dispatcher }
    }
}

#[async_trait]
impl JobHandler for AnalyticsHandler {
    fn name(&self) -> &'static str {
        "analytics"
    }

    async fn handle(&self, _ctx: &JobContext, job: &JobEnvelope) -> Result<(), PipelineError> {
        let result = self.stages.run_analytics(&job.meeting_id).await;
        let deliver = settle(&self.stages, &job.meeting_id, result).await?;

        if deliver {
            self.dispatcher
                .enqueue(
                    &job.meeting_id,
                    PipelineStep::Delivery,
                    json!({}),
                    job.trace.child(),
                )
                .await?;
        } else {
            self.stages.mark_done(&job.meeting_id).await?;
        }
        Ok(())
    }
}

pub struct DeliveryHandler {
    stages: Arc<Stages>,
}

impl DeliveryHandler {
    pub fn new(stages: Arc<Stages>) -> Self {
        Self { stages }
    }
}

#[async_trait]
impl JobHandler for DeliveryHandler {
    fn name(&self) -> &'static str {
        "delivery"
    }

    async fn handle(&self, _ctx: &JobContext, job: &JobEnvelope) -> Result<(), PipelineError> {
        let result = self.stages.run_delivery(&job.meeting_id).await;
        settle(&self.stages, &job.meeting_id, result).await?;
        self.stages.mark_done(&job.meeting_id).await?;
        Ok(())
    }
}
