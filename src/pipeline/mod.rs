//! The staged processing pipeline.
//!
//! Stage logic lives in [`Stages`] and is shared by two execution
//! shells: queue-backed handlers driven by the worker harness, and the
//! inline composite that runs everything in the request path. Both
//! produce identical artifacts because they call the same code.

mod handlers;
mod inline;
mod stages;

pub use handlers::{AnalyticsHandler, DeliveryHandler, EnhanceHandler, SttHandler};
pub use inline::InlinePipeline;
pub use stages::{Stages, SttOutcome};

use std::sync::Arc;

use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Broker, JobEnvelope, PipelineStep};
use crate::trace::TraceContext;

/// Enqueues stage jobs with the configured attempt budget.
#[derive(Clone)]
pub struct QueueDispatcher {
    broker: Arc<dyn Broker>,
    max_attempts: u32,
}

impl QueueDispatcher {
    pub fn new(broker: Arc<dyn Broker>, max_attempts: u32) -> Self {
        Self {
            broker,
            max_attempts,
        }
    }

    pub async fn enqueue(
        &self,
        meeting_id: &str,
        step: PipelineStep,
        payload: serde_json::Value,
        trace: TraceContext,
    ) -> Result<Uuid, QueueError> {
        let job = JobEnvelope::new(meeting_id, step, payload, self.max_attempts, trace);
        let job_id = job.job_id;
        self.broker.enqueue(&job).await?;
        tracing::debug!(
            meeting_id = %meeting_id,
            step = %step,
            job_id = %job_id,
            "stage job enqueued"
        );
        Ok(job_id)
    }
}
