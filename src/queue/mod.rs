//! Queue fabric: named FIFO queues with at-least-once delivery.
//!
//! Each queue carries a dead-letter queue and a pending set for in-flight
//! jobs. A reserved job stays pending until it is acked, nacked, or its
//! visibility timeout lapses, after which any worker may reserve it
//! again. `nack` re-queues with backoff until the attempt budget is
//! spent, then routes to the DLQ with the reason preserved.
//!
//! The broker also hosts TTL leases (`acquire_lock`/`release_lock`) used
//! by the connector operation lock, so a crashed holder frees the lock
//! by expiry rather than by cleanup code that may never run.

mod envelope;
mod memory;
mod pg;
pub mod worker;

pub use envelope::{JobEnvelope, PipelineStep, idempotency_key};
pub use memory::MemoryBroker;
pub use pg::PgBroker;
pub use worker::{JobContext, JobHandler, Worker};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// A job parked on a dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub job: JobEnvelope,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// Observational depths for one queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueDepths {
    pub ready: u64,
    pub pending: u64,
    pub dlq: u64,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job: &JobEnvelope) -> Result<(), QueueError>;

    /// Reserve the next visible job, making it invisible to other
    /// workers for `visibility_timeout`.
    async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<JobEnvelope>, QueueError>;

    /// Commit a reserved job: it is gone for good.
    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<(), QueueError>;

    /// Return a reserved job to the queue after `delay`, bumping its
    /// attempt counter. Once attempts exceed the envelope's budget the
    /// job lands on the DLQ instead, with `reason` preserved.
    async fn nack(
        &self,
        queue: &str,
        job_id: Uuid,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Move a reserved job straight to the DLQ (non-retryable failure).
    async fn dlq_push(&self, queue: &str, job_id: Uuid, reason: &str) -> Result<(), QueueError>;

    async fn depths(&self, queue: &str) -> Result<QueueDepths, QueueError>;

    async fn dlq_list(&self, queue: &str) -> Result<Vec<DlqEntry>, QueueError>;

    /// Operator-triggered replay: put a dead job back on its queue with
    /// a fresh attempt budget and its original trace context.
    async fn dlq_replay(&self, queue: &str, job_id: Uuid) -> Result<JobEnvelope, QueueError>;

    // --- TTL leases ---

    /// Try to take a named lease. Returns false when someone else holds
    /// an unexpired lease on the key.
    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, QueueError>;

    /// Release a lease if this owner still holds it.
    async fn release_lock(&self, key: &str, owner: &str) -> Result<(), QueueError>;
}

/// Queue names known to the health endpoint.
pub fn pipeline_queues() -> impl Iterator<Item = &'static str> {
    PipelineStep::ALL.iter().map(|s| s.queue_name())
}

/// Exponential backoff for the nth retry, with jitter.
pub fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(10)));
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    exp.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows() {
        let base = Duration::from_millis(100);
        let first = retry_backoff(base, 0);
        let fourth = retry_backoff(base, 3);
        assert!(first >= Duration::from_millis(80));
        assert!(first <= Duration::from_millis(120));
        assert!(fourth >= Duration::from_millis(640));
    }

    #[test]
    fn test_pipeline_queue_list() {
        let queues: Vec<_> = pipeline_queues().collect();
        assert_eq!(queues, vec!["q:stt", "q:enhancer", "q:analytics", "q:delivery"]);
    }
}
