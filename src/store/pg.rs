//! PostgreSQL meeting store.
//!
//! Raw SQL over a deadpool pool. Per-meeting serialization uses
//! transaction-scoped advisory locks, so a crashed writer can never
//! strand a lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::NoTls;
use tokio_postgres::error::SqlState;

use crate::audit::{AuditDecision, AuditEvent};
use crate::connector::ConnectorSession;
use crate::error::StoreError;
use crate::store::{Artifact, ArtifactKind, ChunkRecord, Meeting, MeetingStatus, MeetingStore};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Create a connection pool shared by Postgres-backed components.
pub async fn pg_pool(url: &str, pool_size: usize) -> Result<Pool, StoreError> {
    let mut cfg = Config::new();
    cfg.url = Some(url.to_string());
    cfg.pool = Some(deadpool_postgres::PoolConfig {
        max_size: pool_size,
        ..Default::default()
    });

    let pool = cfg
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| StoreError::Pool(e.to_string()))?;

    // Test connection
    let _ = pool.get().await?;

    Ok(pool)
}

pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Create a store and verify connectivity.
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self, StoreError> {
        Ok(Self {
            pool: pg_pool(url, pool_size).await?,
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }

    /// Apply embedded migrations over a dedicated connection.
    pub async fn run_migrations(url: &str) -> Result<(), StoreError> {
        let (mut client, connection) = tokio_postgres::connect(url, NoTls).await?;
        let driver = tokio::spawn(connection);

        embedded::migrations::runner()
            .run_async(&mut client)
            .await
            .map_err(|e| StoreError::Db(e.to_string()))?;

        drop(client);
        let _ = driver.await;
        Ok(())
    }

    /// Share the pool with other Postgres-backed components.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        Ok(self.pool.get().await?)
    }
}

fn meeting_from_row(row: &tokio_postgres::Row) -> Result<Meeting, StoreError> {
    Ok(Meeting {
        meeting_id: row.get("meeting_id"),
        tenant: row.get("tenant"),
        mode: row.get::<_, String>("mode").parse().map_err(StoreError::Db)?,
        status: row
            .get::<_, String>("status")
            .parse()
            .map_err(StoreError::Db)?,
        created_at: row.get("created_at"),
        connector_provider: row.get("connector_provider"),
        epoch: row.get("epoch"),
        finalized_at: row.get("finalized_at"),
        last_chunk_at: row.get("last_chunk_at"),
        delivery_recipient: row.get("delivery_recipient"),
    })
}

fn chunk_from_row(row: &tokio_postgres::Row) -> Result<ChunkRecord, StoreError> {
    Ok(ChunkRecord {
        meeting_id: row.get("meeting_id"),
        chunk_seq: row.get::<_, i64>("chunk_seq") as u64,
        media_ref: row.get("media_ref"),
        received_at: row.get("received_at"),
        trace: serde_json::from_value(row.get("trace"))
            .map_err(|e| StoreError::Db(e.to_string()))?,
    })
}

fn session_from_row(row: &tokio_postgres::Row) -> Result<ConnectorSession, StoreError> {
    Ok(ConnectorSession {
        meeting_id: row.get("meeting_id"),
        provider: row.get("provider"),
        state: row
            .get::<_, String>("state")
            .parse()
            .map_err(StoreError::Db)?,
        provider_ref: row.get("provider_ref"),
        joined_at: row.get("joined_at"),
        last_seen: row.get("last_seen"),
        consecutive_live_pull_failures: row.get::<_, i32>("consecutive_live_pull_failures") as u32,
        last_error: row.get("last_error"),
    })
}

#[async_trait]
impl MeetingStore for PgStore {
    async fn create_meeting(&self, meeting: &Meeting) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let result = conn
            .execute(
                "INSERT INTO meetings \
                 (meeting_id, tenant, mode, status, created_at, connector_provider, epoch, \
                  finalized_at, last_chunk_at, delivery_recipient) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &meeting.meeting_id,
                    &meeting.tenant,
                    &meeting.mode.to_string(),
                    &meeting.status.to_string(),
                    &meeting.created_at,
                    &meeting.connector_provider,
                    &meeting.epoch,
                    &meeting.finalized_at,
                    &meeting.last_chunk_at,
                    &meeting.delivery_recipient,
                ],
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(StoreError::AlreadyExists(meeting.meeting_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_meeting(&self, meeting_id: &str) -> Result<Option<Meeting>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT * FROM meetings WHERE meeting_id = $1", &[&meeting_id])
            .await?;
        row.as_ref().map(meeting_from_row).transpose()
    }

    async fn set_status(
        &self,
        meeting_id: &str,
        status: MeetingStatus,
        rebuild: bool,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT status FROM meetings WHERE meeting_id = $1 FOR UPDATE",
                &[&meeting_id],
            )
            .await?
            .ok_or_else(|| StoreError::MeetingNotFound(meeting_id.to_string()))?;

        let current: MeetingStatus = row
            .get::<_, String>("status")
            .parse()
            .map_err(StoreError::Db)?;
        if !current.can_transition(status, rebuild) {
            return Err(StoreError::StatusRegression {
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        tx.execute(
            "UPDATE meetings SET status = $2 WHERE meeting_id = $1",
            &[&meeting_id, &status.to_string()],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn bind_connector(&self, meeting_id: &str, provider: &str) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE meetings SET connector_provider = $2 WHERE meeting_id = $1",
                &[&meeting_id, &provider],
            )
            .await?;
        if n == 0 {
            return Err(StoreError::MeetingNotFound(meeting_id.to_string()));
        }
        Ok(())
    }

    async fn set_finalized(&self, meeting_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let n = conn
            .execute(
                "UPDATE meetings SET finalized_at = now() \
                 WHERE meeting_id = $1 AND finalized_at IS NULL",
                &[&meeting_id],
            )
            .await?;
        if n == 0 {
            // Distinguish "already finalized" from "no such meeting".
            let exists = conn
                .query_opt("SELECT 1 FROM meetings WHERE meeting_id = $1", &[&meeting_id])
                .await?
                .is_some();
            if !exists {
                return Err(StoreError::MeetingNotFound(meeting_id.to_string()));
            }
        }
        Ok(n > 0)
    }

    async fn bump_epoch(&self, meeting_id: &str) -> Result<i64, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE meetings SET epoch = epoch + 1 WHERE meeting_id = $1 RETURNING epoch",
                &[&meeting_id],
            )
            .await?
            .ok_or_else(|| StoreError::MeetingNotFound(meeting_id.to_string()))?;
        Ok(row.get("epoch"))
    }

    async fn idle_unfinalized(
        &self,
        idle_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT meeting_id FROM meetings \
                 WHERE status = 'ingesting' AND finalized_at IS NULL \
                   AND last_chunk_at IS NOT NULL AND last_chunk_at < $1 \
                 ORDER BY last_chunk_at ASC LIMIT $2",
                &[&idle_before, &(limit as i64)],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("meeting_id")).collect())
    }

    async fn allocate_chunk_seq(&self, meeting_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE meetings SET next_chunk_seq = next_chunk_seq + 1 \
                 WHERE meeting_id = $1 RETURNING next_chunk_seq - 1 AS seq",
                &[&meeting_id],
            )
            .await?
            .ok_or_else(|| StoreError::MeetingNotFound(meeting_id.to_string()))?;
        Ok(row.get::<_, i64>("seq") as u64)
    }

    async fn insert_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        let trace = serde_json::to_value(&chunk.trace).map_err(|e| StoreError::Db(e.to_string()))?;
        let conn = self.conn().await?;
        let result = conn
            .execute(
                "INSERT INTO chunks (meeting_id, chunk_seq, media_ref, received_at, trace) \
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &chunk.meeting_id,
                    &(chunk.chunk_seq as i64),
                    &chunk.media_ref,
                    &chunk.received_at,
                    &trace,
                ],
            )
            .await;

        match result {
            Ok(_) => {
                conn.execute(
                    "UPDATE meetings SET last_chunk_at = $2 WHERE meeting_id = $1",
                    &[&chunk.meeting_id, &chunk.received_at],
                )
                .await?;
                Ok(())
            }
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(StoreError::DuplicateChunk {
                    meeting_id: chunk.meeting_id.clone(),
                    seq: chunk.chunk_seq,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn chunk_count(&self, meeting_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT count(*) AS n FROM chunks WHERE meeting_id = $1",
                &[&meeting_id],
            )
            .await?;
        Ok(row.get::<_, i64>("n") as u64)
    }

    async fn get_chunk(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
    ) -> Result<Option<ChunkRecord>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM chunks WHERE meeting_id = $1 AND chunk_seq = $2",
                &[&meeting_id, &(chunk_seq as i64)],
            )
            .await?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn put_artifact(
        &self,
        meeting_id: &str,
        kind: ArtifactKind,
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1)::bigint)",
            &[&meeting_id],
        )
        .await?;
        tx.execute(
            "INSERT INTO artifacts (meeting_id, kind, data, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (meeting_id, kind) DO UPDATE SET data = $3, updated_at = now()",
            &[&meeting_id, &kind.to_string(), data],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn merge_transcript_segment(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
        text: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtext($1)::bigint)",
            &[&meeting_id],
        )
        .await?;

        let kind = ArtifactKind::RawTranscript.to_string();
        let existing = tx
            .query_opt(
                "SELECT data FROM artifacts WHERE meeting_id = $1 AND kind = $2",
                &[&meeting_id, &kind],
            )
            .await?;

        let mut data = match existing {
            Some(row) => row.get::<_, serde_json::Value>("data"),
            None => serde_json::json!({ "segments": {} }),
        };
        let segments = data
            .get_mut("segments")
            .and_then(|v| v.as_object_mut())
            .ok_or_else(|| StoreError::Db("raw transcript artifact is malformed".to_string()))?;
        segments.insert(
            chunk_seq.to_string(),
            serde_json::Value::String(text.to_string()),
        );
        let count = segments.len() as u64;

        tx.execute(
            "INSERT INTO artifacts (meeting_id, kind, data, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (meeting_id, kind) DO UPDATE SET data = $3, updated_at = now()",
            &[&meeting_id, &kind, &data],
        )
        .await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn get_artifact(
        &self,
        meeting_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<Artifact>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT data, updated_at FROM artifacts WHERE meeting_id = $1 AND kind = $2",
                &[&meeting_id, &kind.to_string()],
            )
            .await?;
        Ok(row.map(|r| Artifact {
            meeting_id: meeting_id.to_string(),
            kind,
            data: r.get("data"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn clear_artifacts(
        &self,
        meeting_id: &str,
        kinds: &[ArtifactKind],
    ) -> Result<(), StoreError> {
        let names: Vec<String> = kinds.iter().map(|k| k.to_string()).collect();
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM artifacts WHERE meeting_id = $1 AND kind = ANY($2)",
            &[&meeting_id, &names],
        )
        .await?;
        Ok(())
    }

    async fn idempotency_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt("SELECT result FROM idempotency_keys WHERE key = $1", &[&key])
            .await?;
        Ok(row.map(|r| r.get("result")))
    }

    async fn idempotency_put(
        &self,
        key: &str,
        result: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO idempotency_keys (key, result) VALUES ($1, $2) \
             ON CONFLICT (key) DO NOTHING",
            &[&key, result],
        )
        .await?;
        Ok(())
    }

    async fn upsert_session(&self, session: &ConnectorSession) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO connector_sessions \
             (meeting_id, provider, state, provider_ref, joined_at, last_seen, \
              consecutive_live_pull_failures, last_error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (meeting_id, provider) DO UPDATE SET \
               state = $3, provider_ref = $4, joined_at = $5, last_seen = $6, \
               consecutive_live_pull_failures = $7, last_error = $8",
            &[
                &session.meeting_id,
                &session.provider,
                &session.state.to_string(),
                &session.provider_ref,
                &session.joined_at,
                &session.last_seen,
                &(session.consecutive_live_pull_failures as i32),
                &session.last_error,
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_session(
        &self,
        meeting_id: &str,
        provider: &str,
    ) -> Result<Option<ConnectorSession>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM connector_sessions WHERE meeting_id = $1 AND provider = $2",
                &[&meeting_id, &provider],
            )
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn delete_session(&self, meeting_id: &str, provider: &str) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM connector_sessions WHERE meeting_id = $1 AND provider = $2",
            &[&meeting_id, &provider],
        )
        .await?;
        Ok(())
    }

    async fn list_sessions(&self, provider: &str) -> Result<Vec<ConnectorSession>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM connector_sessions WHERE provider = $1 ORDER BY meeting_id",
                &[&provider],
            )
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn stale_connected_sessions(
        &self,
        provider: &str,
        seen_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ConnectorSession>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM connector_sessions \
                 WHERE provider = $1 AND state = 'connected' \
                   AND (last_seen IS NULL OR last_seen < $2) \
                 ORDER BY last_seen ASC NULLS FIRST LIMIT $3",
                &[&provider, &seen_before, &(limit as i64)],
            )
            .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO security_audit_events \
             (ts, endpoint, method, subject, auth_type, decision, reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &event.ts,
                &event.endpoint,
                &event.method,
                &event.subject,
                &event.auth_type,
                &event.decision.to_string(),
                &event.reason,
            ],
        )
        .await?;
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT * FROM security_audit_events ORDER BY id DESC LIMIT $1",
                &[&(limit as i64)],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let decision = match row.get::<_, String>("decision").as_str() {
                    "allow" => AuditDecision::Allow,
                    _ => AuditDecision::Deny,
                };
                Ok(AuditEvent {
                    ts: row.get("ts"),
                    endpoint: row.get("endpoint"),
                    method: row.get("method"),
                    subject: row.get("subject"),
                    auth_type: row.get("auth_type"),
                    decision,
                    reason: row.get("reason"),
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }
}
