//! Postgres-backed broker.
//!
//! One row per job; reservation uses `FOR UPDATE SKIP LOCKED` so
//! concurrent workers never fight over the same row. Shares the
//! deadpool pool with the Postgres meeting store.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::Pool;
use uuid::Uuid;

use crate::error::QueueError;
use crate::queue::{Broker, DlqEntry, JobEnvelope, QueueDepths};

pub struct PgBroker {
    pool: Pool,
}

impl PgBroker {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, QueueError> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))
    }
}

fn envelope_from_value(value: serde_json::Value) -> Result<JobEnvelope, QueueError> {
    serde_json::from_value(value).map_err(|e| QueueError::Codec(e.to_string()))
}

#[async_trait]
impl Broker for PgBroker {
    async fn enqueue(&self, job: &JobEnvelope) -> Result<(), QueueError> {
        let envelope = serde_json::to_value(job)?;
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO broker_jobs (queue, job_id, state, envelope, visible_at) \
             VALUES ($1, $2, 'ready', $3, $4)",
            &[&job.queue, &job.job_id, &envelope, &job.visible_at],
        )
        .await
        .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<JobEnvelope>, QueueError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "WITH next AS ( \
                   SELECT job_id FROM broker_jobs \
                   WHERE queue = $1 \
                     AND ((state = 'ready' AND visible_at <= now()) \
                       OR (state = 'pending' AND lease_expires_at <= now())) \
                   ORDER BY visible_at ASC \
                   LIMIT 1 \
                   FOR UPDATE SKIP LOCKED \
                 ) \
                 UPDATE broker_jobs b \
                 SET state = 'pending', reserved_by = $2, \
                     lease_expires_at = now() + make_interval(secs => $3) \
                 FROM next WHERE b.queue = $1 AND b.job_id = next.job_id \
                 RETURNING b.envelope",
                &[&queue, &worker_id, &visibility_timeout.as_secs_f64()],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        row.map(|r| envelope_from_value(r.get("envelope"))).transpose()
    }

    async fn ack(&self, queue: &str, job_id: Uuid) -> Result<(), QueueError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "DELETE FROM broker_jobs \
                 WHERE queue = $1 AND job_id = $2 AND state = 'pending'",
                &[&queue, &job_id],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        if n == 0 {
            return Err(QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id,
            });
        }
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        job_id: Uuid,
        reason: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let row = tx
            .query_opt(
                "SELECT envelope FROM broker_jobs \
                 WHERE queue = $1 AND job_id = $2 AND state = 'pending' FOR UPDATE",
                &[&queue, &job_id],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?
            .ok_or_else(|| QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id,
            })?;

        let mut job = envelope_from_value(row.get("envelope"))?;
        job.attempt += 1;

        if job.attempt >= job.max_attempts {
            let envelope = serde_json::to_value(&job)?;
            tx.execute(
                "UPDATE broker_jobs \
                 SET state = 'dlq', envelope = $3, reason = $4, dead_at = now(), \
                     reserved_by = NULL, lease_expires_at = NULL \
                 WHERE queue = $1 AND job_id = $2",
                &[&queue, &job_id, &envelope, &reason],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        } else {
            let envelope = serde_json::to_value(&job)?;
            tx.execute(
                "UPDATE broker_jobs \
                 SET state = 'ready', envelope = $3, \
                     visible_at = now() + make_interval(secs => $4), \
                     reserved_by = NULL, lease_expires_at = NULL \
                 WHERE queue = $1 AND job_id = $2",
                &[&queue, &job_id, &envelope, &delay.as_secs_f64()],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn dlq_push(&self, queue: &str, job_id: Uuid, reason: &str) -> Result<(), QueueError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE broker_jobs \
                 SET state = 'dlq', reason = $3, dead_at = now(), \
                     reserved_by = NULL, lease_expires_at = NULL \
                 WHERE queue = $1 AND job_id = $2 AND state = 'pending'",
                &[&queue, &job_id, &reason],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        if n == 0 {
            return Err(QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id,
            });
        }
        Ok(())
    }

    async fn depths(&self, queue: &str) -> Result<QueueDepths, QueueError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT \
                   count(*) FILTER (WHERE state = 'ready' \
                     OR (state = 'pending' AND lease_expires_at <= now())) AS ready, \
                   count(*) FILTER (WHERE state = 'pending' AND lease_expires_at > now()) AS pending, \
                   count(*) FILTER (WHERE state = 'dlq') AS dlq \
                 FROM broker_jobs WHERE queue = $1",
                &[&queue],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(QueueDepths {
            ready: row.get::<_, i64>("ready") as u64,
            pending: row.get::<_, i64>("pending") as u64,
            dlq: row.get::<_, i64>("dlq") as u64,
        })
    }

    async fn dlq_list(&self, queue: &str) -> Result<Vec<DlqEntry>, QueueError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT envelope, reason, dead_at FROM broker_jobs \
                 WHERE queue = $1 AND state = 'dlq' ORDER BY dead_at ASC",
                &[&queue],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                Ok(DlqEntry {
                    job: envelope_from_value(row.get("envelope"))?,
                    reason: row.get::<_, Option<String>>("reason").unwrap_or_default(),
                    dead_at: row.get("dead_at"),
                })
            })
            .collect()
    }

    async fn dlq_replay(&self, queue: &str, job_id: Uuid) -> Result<JobEnvelope, QueueError> {
        let mut conn = self.conn().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let row = tx
            .query_opt(
                "SELECT envelope FROM broker_jobs \
                 WHERE queue = $1 AND job_id = $2 AND state = 'dlq' FOR UPDATE",
                &[&queue, &job_id],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?
            .ok_or_else(|| QueueError::UnknownJob {
                queue: queue.to_string(),
                job_id,
            })?;

        let mut job = envelope_from_value(row.get("envelope"))?;
        job.attempt = 0;
        let envelope = serde_json::to_value(&job)?;

        tx.execute(
            "UPDATE broker_jobs \
             SET state = 'ready', envelope = $3, visible_at = now(), \
                 reason = NULL, dead_at = NULL \
             WHERE queue = $1 AND job_id = $2",
            &[&queue, &job_id, &envelope],
        )
        .await
        .map_err(|e| QueueError::Broker(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(job)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, QueueError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "INSERT INTO broker_locks (key, owner, expires_at) \
                 VALUES ($1, $2, now() + make_interval(secs => $3)) \
                 ON CONFLICT (key) DO UPDATE \
                 SET owner = $2, expires_at = now() + make_interval(secs => $3) \
                 WHERE broker_locks.expires_at <= now() OR broker_locks.owner = $2",
                &[&key, &owner, &ttl.as_secs_f64()],
            )
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(n > 0)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<(), QueueError> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM broker_locks WHERE key = $1 AND owner = $2",
            &[&key, &owner],
        )
        .await
        .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }
}
