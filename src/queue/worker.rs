//! Worker harness: reserve, execute, commit.
//!
//! A worker polls one queue, runs its handler with a bounded number of
//! jobs in flight, and settles each job exactly one way: `ack` on
//! success, `nack` with backoff on a retryable failure, `dlq_push` on a
//! non-retryable one. Shutdown is cooperative: no new reservations, then
//! in-flight jobs get a drain deadline before the process lets their
//! visibility leases lapse for some other worker to pick up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::queue::{Broker, JobEnvelope, retry_backoff};
use crate::trace::TraceContext;

/// How long a worker naps when its queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Execution context handed to a handler along with the job.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub worker_id: String,
    pub queue: String,
    pub attempt: u32,
    pub trace: TraceContext,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &JobContext, job: &JobEnvelope) -> Result<(), PipelineError>;
}

pub struct Worker {
    queue: String,
    handler: Arc<dyn JobHandler>,
    broker: Arc<dyn Broker>,
    metrics: Arc<Metrics>,
    concurrency: usize,
    visibility_timeout: Duration,
    base_backoff: Duration,
    drain_deadline: Duration,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        broker: Arc<dyn Broker>,
        metrics: Arc<Metrics>,
        concurrency: usize,
        visibility_timeout: Duration,
        base_backoff: Duration,
        drain_deadline: Duration,
    ) -> Self {
        Self {
            queue: queue.into(),
            handler,
            broker,
            metrics,
            concurrency: concurrency.max(1),
            visibility_timeout,
            base_backoff,
            drain_deadline,
        }
    }

    /// Run until the shutdown signal flips, then drain.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<()> = JoinSet::new();
        let worker_id = format!("{}#{}", self.queue, Uuid::new_v4());

        tracing::info!(
            queue = %self.queue,
            handler = self.handler.name(),
            concurrency = self.concurrency,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Opportunistically reap finished tasks so the JoinSet does
            // not grow without bound on a busy queue.
            while tasks.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            match self
                .broker
                .reserve(&self.queue, &worker_id, self.visibility_timeout)
                .await
            {
                Ok(Some(job)) => {
                    let this = Arc::clone(&self);
                    let id = worker_id.clone();
                    tasks.spawn(async move {
                        this.process_one(&id, job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(queue = %self.queue, "reserve failed: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        // Drain: give in-flight jobs a bounded window to finish. Anything
        // still running afterwards will reappear on the queue once its
        // visibility lease expires.
        let drained = tokio::time::timeout(self.drain_deadline, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                queue = %self.queue,
                "drain deadline hit with jobs still in flight; leases will expire"
            );
        }
        tracing::info!(queue = %self.queue, "worker stopped");
    }

    async fn process_one(&self, worker_id: &str, job: JobEnvelope) {
        let ctx = JobContext {
            worker_id: worker_id.to_string(),
            queue: self.queue.clone(),
            attempt: job.attempt,
            trace: job.trace.clone(),
        };

        let started = std::time::Instant::now();
        let result = self.handler.handle(&ctx, &job).await;
        let elapsed = started.elapsed();

        let stage = self.metrics.stage(&self.queue);
        if let Some(stage) = stage {
            stage.observe_latency(elapsed);
        }

        match result {
            Ok(()) => {
                if let Some(stage) = stage {
                    stage.processed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                tracing::debug!(
                    queue = %self.queue,
                    job_id = %job.job_id,
                    meeting_id = %job.meeting_id,
                    trace_id = %job.trace.trace_id,
                    span_id = %job.trace.span_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "job done"
                );
                if let Err(e) = self.broker.ack(&self.queue, job.job_id).await {
                    tracing::error!(queue = %self.queue, job_id = %job.job_id, "ack failed: {}", e);
                }
            }
            Err(e) if e.is_retryable() => {
                if let Some(stage) = stage {
                    stage.retried.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                let delay = retry_backoff(self.base_backoff, job.attempt);
                tracing::warn!(
                    queue = %self.queue,
                    job_id = %job.job_id,
                    meeting_id = %job.meeting_id,
                    trace_id = %job.trace.trace_id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "job failed, retrying: {}", e
                );
                if let Err(e) = self
                    .broker
                    .nack(&self.queue, job.job_id, &e.to_string(), delay)
                    .await
                {
                    tracing::error!(queue = %self.queue, job_id = %job.job_id, "nack failed: {}", e);
                }
            }
            Err(e) => {
                if let Some(stage) = stage {
                    stage.failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    stage
                        .dead_lettered
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                tracing::error!(
                    queue = %self.queue,
                    job_id = %job.job_id,
                    meeting_id = %job.meeting_id,
                    trace_id = %job.trace.trace_id,
                    "job failed terminally, dead-lettering: {}", e
                );
                if let Err(e) = self
                    .broker
                    .dlq_push(&self.queue, job.job_id, &e.to_string())
                    .await
                {
                    tracing::error!(queue = %self.queue, job_id = %job.job_id, "dlq push failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryBroker, PipelineStep};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        calls: AtomicU32,
        fail_first: u32,
        retryable: bool,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _ctx: &JobContext, _job: &JobEnvelope) -> Result<(), PipelineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                if self.retryable {
                    Err(PipelineError::Provider("stt backend down".into()))
                } else {
                    Err(PipelineError::InvalidPayload("garbage".into()))
                }
            } else {
                Ok(())
            }
        }
    }

    async fn run_worker_until_settled(broker: Arc<MemoryBroker>, handler: Arc<FlakyHandler>) {
        let metrics = Arc::new(Metrics::new());
        let worker = Arc::new(Worker::new(
            "q:stt",
            handler,
            broker.clone() as Arc<dyn Broker>,
            metrics,
            1,
            Duration::from_secs(5),
            Duration::from_millis(1),
            Duration::from_secs(1),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        // Let the worker settle the queue.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let d = broker.depths("q:stt").await.unwrap();
            if d.ready == 0 && d.pending == 0 {
                break;
            }
        }
        let _ = tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_retryable_failure_eventually_succeeds() {
        let broker = Arc::new(MemoryBroker::new());
        let job = JobEnvelope::new(
            "m1",
            PipelineStep::Stt,
            json!({"seq": 0}),
            5,
            TraceContext::new_root(),
        );
        broker.enqueue(&job).await.unwrap();

        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_first: 2,
            retryable: true,
        });
        run_worker_until_settled(broker.clone(), handler.clone()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let d = broker.depths("q:stt").await.unwrap();
        assert_eq!((d.ready, d.pending, d.dlq), (0, 0, 0));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_goes_to_dlq() {
        let broker = Arc::new(MemoryBroker::new());
        let job = JobEnvelope::new(
            "m1",
            PipelineStep::Stt,
            json!({"seq": 0}),
            5,
            TraceContext::new_root(),
        );
        broker.enqueue(&job).await.unwrap();

        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_first: 10,
            retryable: false,
        });
        run_worker_until_settled(broker.clone(), handler.clone()).await;

        // One delivery, no retries.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        let d = broker.depths("q:stt").await.unwrap();
        assert_eq!(d.dlq, 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_dead_letters_exactly_once() {
        let broker = Arc::new(MemoryBroker::new());
        let job = JobEnvelope::new(
            "m1",
            PipelineStep::Stt,
            json!({"seq": 0}),
            3,
            TraceContext::new_root(),
        );
        broker.enqueue(&job).await.unwrap();

        let handler = Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            fail_first: 99,
            retryable: true,
        });
        run_worker_until_settled(broker.clone(), handler.clone()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let d = broker.depths("q:stt").await.unwrap();
        assert_eq!((d.ready, d.pending, d.dlq), (0, 0, 1));
        assert_eq!(broker.dlq_list("q:stt").await.unwrap().len(), 1);
    }
}
