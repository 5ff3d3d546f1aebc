//! In-memory broker for inline mode, development and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Broker, DlqEntry, JobEnvelope, QueueDepths};

#[derive(Default)]
struct QueueState {
    /// Jobs waiting to be reserved, in FIFO order by `visible_at`.
    ready: Vec<JobEnvelope>,
    /// Reserved jobs keyed by id, with their lease expiry.
    pending: HashMap<Uuid, (JobEnvelope, DateTime<Utc>)>,
    dlq: Vec<DlqEntry>,
}

struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueState {
    /// Return expired pending jobs to the ready list so another worker
    /// can pick them up. This is what makes delivery at-least-once.
    fn reap_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, (_, lease))| *lease <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((job, _)) = self.pending.remove(&id) {
                self.ready.push(job);
            }
        }
    }

    fn take_next_visible(&mut self, now: DateTime<Utc>) -> Option<JobEnvelope> {
        let idx = self
            .ready
            .iter()
            .enumerate()
            .filter(|(_, j)| j.visible_at <= now)
            .min_by_key(|(_, j)| (j.visible_at, j.enqueued_at))
            .map(|(i, _)| i)?;
        Some(self.ready.remove(idx))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job: &JobEnvelope) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(job.queue.clone())
            .or_default()
            .ready
            .push(job.clone());
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        _worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<JobEnvelope>, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let now = Utc::now();
        state.reap_expired(now);

        let Some(job) = state.take_next_visible(now) else {
            return Ok(None);
        };
        let lease = now
            + chrono::Duration::from_std(visibility_timeout)
                .map_err(|e| QueueError::Broker(e.to_string()))?;
        state.pending.insert(job.job_id, (job.clone(), lease));
        Ok(Some(job))
    }

    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state
            .pending
            .remove(&job_id)
            .ok_or_else(|| QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id,
            })?;
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        job_id: Uuid,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let (mut job, _) = state
            .pending
            .remove(&job_id)
            .ok_or_else(|| QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id,
            })?;

        job.attempt += 1;
        if job.attempt >= job.max_attempts {
            state.dlq.push(DlqEntry {
                job,
                reason: reason.to_string(),
                dead_at: Utc::now(),
            });
            return Ok(());
        }

        job.visible_at = Utc::now()
            + chrono::Duration::from_std(delay).map_err(|e| QueueError::Broker(e.to_string()))?;
        state.ready.push(job);
        Ok(())
    }

    async fn dlq_push(&self, queue: &str, job_id: Uuid, reason: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let (job, _) = state
            .pending
            .remove(&job_id)
            .ok_or_else(|| QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id,
            })?;
        state.dlq.push(DlqEntry {
            job,
            reason: reason.to_string(),
            dead_at: Utc::now(),
        });
        Ok(())
    }

    async fn depths(&self, queue: &str) -> Result<QueueDepths, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.reap_expired(Utc::now());
        Ok(QueueDepths {
            ready: state.ready.len() as u64,
            pending: state.pending.len() as u64,
            dlq: state.dlq.len() as u64,
        })
    }

    async fn dlq_list(&self, queue: &str) -> Result<Vec<DlqEntry>, QueueError> {
        let mut queues = self.queues.lock().await;
        Ok(queues.entry(queue.to_string()).or_default().dlq.clone())
    }

    async fn dlq_replay(&self, queue: &str, job_id: Uuid) -> Result<JobEnvelope, QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let idx = state
            .dlq
            .iter()
            .position(|e| e.job.job_id == job_id)
            .ok_or_else(|| QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id,
            })?;
        let entry = state.dlq.remove(idx);
        let mut job = entry.job;
        job.attempt = 0;
        job.visible_at = Utc::now();
        state.ready.push(job.clone());
        Ok(job)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, QueueError> {
        let mut leases = self.leases.lock().await;
        let now = Utc::now();
        if let Some(lease) = leases.get(key) {
            if lease.expires_at > now && lease.owner != owner {
                return Ok(false);
            }
        }
        let expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|e| QueueError::Broker(e.to_string()))?;
        leases.insert(
            key.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<(), QueueError> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|l| l.owner == owner) {
            leases.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::PipelineStep;
    use crate::trace::TraceContext;
    use serde_json::json;

    fn job(max_attempts: u32) -> JobEnvelope {
        JobEnvelope::new(
            "m1",
            PipelineStep::Stt,
            json!({"seq": 0}),
            max_attempts,
            TraceContext::new_root(),
        )
    }

    #[tokio::test]
    async fn test_reserve_ack_removes_job() {
        let broker = MemoryBroker::new();
        let j = job(3);
        broker.enqueue(&j).await.unwrap();

        let got = broker
            .reserve("q:stt", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("job available");
        assert_eq!(got.job_id, j.job_id);

        // Reserved job is invisible to other workers.
        assert!(
            broker
                .reserve("q:stt", "w2", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );

        broker.ack("q:stt", j.job_id).await.unwrap();
        let depths = broker.depths("q:stt").await.unwrap();
        assert_eq!((depths.ready, depths.pending, depths.dlq), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_visibility_expiry_redelivers() {
        let broker = MemoryBroker::new();
        let j = job(3);
        broker.enqueue(&j).await.unwrap();

        let _ = broker
            .reserve("q:stt", "w1", Duration::from_millis(10))
            .await
            .unwrap()
            .expect("job available");

        tokio::time::sleep(Duration::from_millis(30)).await;

        let again = broker
            .reserve("q:stt", "w2", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("job redelivered after lease expiry");
        assert_eq!(again.job_id, j.job_id);
    }

    #[tokio::test]
    async fn test_nack_exhaustion_routes_to_dlq_once() {
        let broker = MemoryBroker::new();
        let j = job(2);
        broker.enqueue(&j).await.unwrap();

        for _ in 0..2 {
            let got = broker
                .reserve("q:stt", "w1", Duration::from_secs(30))
                .await
                .unwrap()
                .expect("job available");
            broker
                .nack("q:stt", got.job_id, "stt backend 503", Duration::ZERO)
                .await
                .unwrap();
        }

        let depths = broker.depths("q:stt").await.unwrap();
        assert_eq!(depths.ready, 0);
        assert_eq!(depths.pending, 0);
        assert_eq!(depths.dlq, 1);

        let dlq = broker.dlq_list("q:stt").await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].reason, "stt backend 503");
    }

    #[tokio::test]
    async fn test_dlq_replay_resets_attempts() {
        let broker = MemoryBroker::new();
        let j = job(1);
        broker.enqueue(&j).await.unwrap();
        let got = broker
            .reserve("q:stt", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("job available");
        broker
            .nack("q:stt", got.job_id, "boom", Duration::ZERO)
            .await
            .unwrap();

        let replayed = broker.dlq_replay("q:stt", j.job_id).await.unwrap();
        assert_eq!(replayed.attempt, 0);
        assert_eq!(replayed.trace, j.trace);
        assert_eq!(broker.depths("q:stt").await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_fifo_order_for_ready_jobs() {
        let broker = MemoryBroker::new();
        let first = job(3);
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = job(3);
        broker.enqueue(&first).await.unwrap();
        broker.enqueue(&second).await.unwrap();

        let got = broker
            .reserve("q:stt", "w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("job available");
        assert_eq!(got.job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_lease_exclusivity_and_expiry() {
        let broker = MemoryBroker::new();
        assert!(
            broker
                .acquire_lock("op:m1", "a", Duration::from_millis(20))
                .await
                .unwrap()
        );
        assert!(
            !broker
                .acquire_lock("op:m1", "b", Duration::from_millis(20))
                .await
                .unwrap()
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(
            broker
                .acquire_lock("op:m1", "b", Duration::from_millis(20))
                .await
                .unwrap()
        );

        broker.release_lock("op:m1", "b").await.unwrap();
        assert!(
            broker
                .acquire_lock("op:m1", "c", Duration::from_millis(20))
                .await
                .unwrap()
        );
    }
}
