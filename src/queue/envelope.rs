//! The canonical job record that moves through the queue fabric.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::trace::TraceContext;

/// A stage of the forward pipeline. Each stage owns one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Stt,
    Enhance,
    Analytics,
    Delivery,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 4] = [
        PipelineStep::Stt,
        PipelineStep::Enhance,
        PipelineStep::Analytics,
        PipelineStep::Delivery,
    ];

    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::Stt => "q:stt",
            Self::Enhance => "q:enhancer",
            Self::Analytics => "q:analytics",
            Self::Delivery => "q:delivery",
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stt => write!(f, "stt"),
            Self::Enhance => write!(f, "enhance"),
            Self::Analytics => write!(f, "analytics"),
            Self::Delivery => write!(f, "delivery"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: Uuid,
    pub queue: String,
    pub meeting_id: String,
    pub step: PipelineStep,
    pub attempt: u32,
    pub max_attempts: u32,
    pub payload: serde_json::Value,
    pub trace: TraceContext,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(
        meeting_id: impl Into<String>,
        step: PipelineStep,
        payload: serde_json::Value,
        max_attempts: u32,
        trace: TraceContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            queue: step.queue_name().to_string(),
            meeting_id: meeting_id.into(),
            step,
            attempt: 0,
            max_attempts,
            payload,
            trace,
            enqueued_at: now,
            visible_at: now,
        }
    }

    /// Deterministic idempotency key for this job.
    ///
    /// Derived purely from `(meeting_id, step, payload, epoch)` so that
    /// retries and re-deliveries of the same logical work share a key,
    /// while a rebuild (which bumps the epoch) does not collide with
    /// stale results.
    pub fn idempotency_key(&self, epoch: i64) -> String {
        idempotency_key(&self.meeting_id, self.step, &self.payload, epoch)
    }
}

pub fn idempotency_key(
    meeting_id: &str,
    step: PipelineStep,
    payload: &serde_json::Value,
    epoch: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(meeting_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(step.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(payload).as_bytes());
    hasher.update([0u8]);
    hasher.update(epoch.to_be_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Render a JSON value with object keys sorted, so logically equal
/// payloads hash identically regardless of construction order.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}
