//! In-memory meeting store.
//!
//! Backs inline mode, local development and tests. A single async mutex
//! guards the whole map set, which also gives the per-meeting write
//! serialization the trait promises.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::audit::AuditEvent;
use crate::connector::ConnectorSession;
use crate::error::StoreError;
use crate::store::{Artifact, ArtifactKind, ChunkRecord, Meeting, MeetingStore};

#[derive(Default)]
struct Inner {
    meetings: HashMap<String, Meeting>,
    seq_counters: HashMap<String, u64>,
    chunks: HashMap<(String, u64), ChunkRecord>,
    artifacts: HashMap<(String, ArtifactKind), Artifact>,
    idempotency: HashMap<String, serde_json::Value>,
    sessions: HashMap<(String, String), ConnectorSession>,
    audit: Vec<AuditEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeetingStore for MemoryStore {
    async fn create_meeting(&self, meeting: &Meeting) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.meetings.contains_key(&meeting.meeting_id) {
            return Err(StoreError::AlreadyExists(meeting.meeting_id.clone()));
        }
        inner
            .meetings
            .insert(meeting.meeting_id.clone(), meeting.clone());
        Ok(())
    }

    async fn get_meeting(&self, meeting_id: &str) -> Result<Option<Meeting>, StoreError> {
        Ok(self.inner.lock().await.meetings.get(meeting_id).cloned())
    }

    async fn set_status(
        &self,
        meeting_id: &str,
        status: crate::store::MeetingStatus,
        rebuild: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let meeting = inner
            .meetings
            .get_mut(meeting_id)
            .ok_or_else(|| StoreError::MeetingNotFound(meeting_id.to_string()))?;
        if !meeting.status.can_transition(status, rebuild) {
            return Err(StoreError::StatusRegression {
                from: meeting.status.to_string(),
                to: status.to_string(),
            });
        }
        meeting.status = status;
        Ok(())
    }

    async fn bind_connector(&self, meeting_id: &str, provider: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let meeting = inner
            .meetings
            .get_mut(meeting_id)
            .ok_or_else(|| StoreError::MeetingNotFound(meeting_id.to_string()))?;
        meeting.connector_provider = Some(provider.to_string());
        Ok(())
    }

    async fn set_finalized(&self, meeting_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let meeting = inner
            .meetings
            .get_mut(meeting_id)
            .ok_or_else(|| StoreError::MeetingNotFound(meeting_id.to_string()))?;
        if meeting.finalized_at.is_some() {
            return Ok(false);
        }
        meeting.finalized_at = Some(Utc::now());
        Ok(true)
    }

    async fn bump_epoch(&self, meeting_id: &str) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let meeting = inner
            .meetings
            .get_mut(meeting_id)
            .ok_or_else(|| StoreError::MeetingNotFound(meeting_id.to_string()))?;
        meeting.epoch += 1;
        Ok(meeting.epoch)
    }

    async fn idle_unfinalized(
        &self,
        idle_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .meetings
            .values()
            .filter(|m| {
                m.status == crate::store::MeetingStatus::Ingesting
                    && m.finalized_at.is_none()
                    && m.last_chunk_at.is_some_and(|t| t < idle_before)
            })
            .take(limit)
            .map(|m| m.meeting_id.clone())
            .collect())
    }

    async fn allocate_chunk_seq(&self, meeting_id: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.meetings.contains_key(meeting_id) {
            return Err(StoreError::MeetingNotFound(meeting_id.to_string()));
        }
        let counter = inner.seq_counters.entry(meeting_id.to_string()).or_insert(0);
        let seq = *counter;
        *counter += 1;
        Ok(seq)
    }

    async fn insert_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (chunk.meeting_id.clone(), chunk.chunk_seq);
        if inner.chunks.contains_key(&key) {
            return Err(StoreError::DuplicateChunk {
                meeting_id: chunk.meeting_id.clone(),
                seq: chunk.chunk_seq,
            });
        }
        if let Some(meeting) = inner.meetings.get_mut(&chunk.meeting_id) {
            meeting.last_chunk_at = Some(chunk.received_at);
        }
        inner.chunks.insert(key, chunk.clone());
        Ok(())
    }

    async fn chunk_count(&self, meeting_id: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chunks
            .keys()
            .filter(|(m, _)| m == meeting_id)
            .count() as u64)
    }

    async fn get_chunk(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
    ) -> Result<Option<ChunkRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .chunks
            .get(&(meeting_id.to_string(), chunk_seq))
            .cloned())
    }

    async fn put_artifact(
        &self,
        meeting_id: &str,
        kind: ArtifactKind,
        data: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.artifacts.insert(
            (meeting_id.to_string(), kind),
            Artifact {
                meeting_id: meeting_id.to_string(),
                kind,
                data: data.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn merge_transcript_segment(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
        text: &str,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (meeting_id.to_string(), ArtifactKind::RawTranscript);
        let artifact = inner.artifacts.entry(key).or_insert_with(|| Artifact {
            meeting_id: meeting_id.to_string(),
            kind: ArtifactKind::RawTranscript,
            data: serde_json::json!({ "segments": {} }),
            updated_at: Utc::now(),
        });
        let segments = artifact
            .data
            .get_mut("segments")
            .and_then(|v| v.as_object_mut())
            .ok_or_else(|| StoreError::Db("raw transcript artifact is malformed".to_string()))?;
        segments.insert(
            chunk_seq.to_string(),
            serde_json::Value::String(text.to_string()),
        );
        let count = segments.len() as u64;
        artifact.updated_at = Utc::now();
        Ok(count)
    }

    async fn get_artifact(
        &self,
        meeting_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<Artifact>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.artifacts.get(&(meeting_id.to_string(), kind)).cloned())
    }

    async fn clear_artifacts(
        &self,
        meeting_id: &str,
        kinds: &[ArtifactKind],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for kind in kinds {
            inner.artifacts.remove(&(meeting_id.to_string(), *kind));
        }
        Ok(())
    }

    async fn idempotency_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.inner.lock().await.idempotency.get(key).cloned())
    }

    async fn idempotency_put(
        &self,
        key: &str,
        result: &serde_json::Value,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .idempotency
            .insert(key.to_string(), result.clone());
        Ok(())
    }

    async fn upsert_session(&self, session: &ConnectorSession) -> Result<(), StoreError> {
        self.inner.lock().await.sessions.insert(
            (session.meeting_id.clone(), session.provider.clone()),
            session.clone(),
        );
        Ok(())
    }

    async fn get_session(
        &self,
        meeting_id: &str,
        provider: &str,
    ) -> Result<Option<ConnectorSession>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .sessions
            .get(&(meeting_id.to_string(), provider.to_string()))
            .cloned())
    }

    async fn delete_session(&self, meeting_id: &str, provider: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .sessions
            .remove(&(meeting_id.to_string(), provider.to_string()));
        Ok(())
    }

    async fn list_sessions(&self, provider: &str) -> Result<Vec<ConnectorSession>, StoreError> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<_> = inner
            .sessions
            .values()
            .filter(|s| s.provider == provider)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.meeting_id.cmp(&b.meeting_id));
        Ok(sessions)
    }

    async fn stale_connected_sessions(
        &self,
        provider: &str,
        seen_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ConnectorSession>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| {
                s.provider == provider
                    && s.state == crate::connector::SessionState::Connected
                    && s.last_seen.is_none_or(|t| t < seen_before)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.inner.lock().await.audit.push(event.clone());
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.audit.iter().rev().take(limit).cloned().collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MeetingMode, MeetingStatus};
    use crate::trace::TraceContext;

    fn chunk(meeting_id: &str, seq: u64) -> ChunkRecord {
        ChunkRecord {
            meeting_id: meeting_id.to_string(),
            chunk_seq: seq,
            media_ref: format!("{meeting_id}/{seq}"),
            received_at: Utc::now(),
            trace: TraceContext::new_root(),
        }
    }

    #[tokio::test]
    async fn test_chunk_seq_allocation_is_unique() {
        let store = MemoryStore::new();
        store
            .create_meeting(&Meeting::new("m1", MeetingMode::Batch, None))
            .await
            .unwrap();

        let a = store.allocate_chunk_seq("m1").await.unwrap();
        let b = store.allocate_chunk_seq("m1").await.unwrap();
        let c = store.allocate_chunk_seq("m1").await.unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
    }

    #[tokio::test]
    async fn test_duplicate_chunk_rejected() {
        let store = MemoryStore::new();
        store
            .create_meeting(&Meeting::new("m1", MeetingMode::Batch, None))
            .await
            .unwrap();

        store.insert_chunk(&chunk("m1", 0)).await.unwrap();
        let err = store.insert_chunk(&chunk("m1", 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateChunk { seq: 0, .. }));
    }

    #[tokio::test]
    async fn test_status_regression_rejected() {
        let store = MemoryStore::new();
        store
            .create_meeting(&Meeting::new("m1", MeetingMode::Batch, None))
            .await
            .unwrap();

        store
            .set_status("m1", MeetingStatus::Processing, false)
            .await
            .unwrap();
        let err = store
            .set_status("m1", MeetingStatus::Ingesting, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusRegression { .. }));
    }

    #[tokio::test]
    async fn test_rebuild_reopens_failed_meeting() {
        let store = MemoryStore::new();
        store
            .create_meeting(&Meeting::new("m1", MeetingMode::Batch, None))
            .await
            .unwrap();
        store
            .set_status("m1", MeetingStatus::Failed, false)
            .await
            .unwrap();

        assert!(
            store
                .set_status("m1", MeetingStatus::Processing, false)
                .await
                .is_err()
        );
        store
            .set_status("m1", MeetingStatus::Processing, true)
            .await
            .unwrap();
        let epoch = store.bump_epoch("m1").await.unwrap();
        assert_eq!(epoch, 1);
    }

    #[tokio::test]
    async fn test_transcript_segments_merge_by_seq() {
        let store = MemoryStore::new();
        store
            .create_meeting(&Meeting::new("m1", MeetingMode::Batch, None))
            .await
            .unwrap();

        assert_eq!(
            store.merge_transcript_segment("m1", 1, "world").await.unwrap(),
            1
        );
        assert_eq!(
            store.merge_transcript_segment("m1", 0, "hello").await.unwrap(),
            2
        );
        // Re-delivery of the same segment is a no-op on the count.
        assert_eq!(
            store.merge_transcript_segment("m1", 0, "hello").await.unwrap(),
            2
        );

        let artifact = store
            .get_artifact("m1", ArtifactKind::RawTranscript)
            .await
            .unwrap()
            .expect("raw transcript exists");
        assert_eq!(artifact.data["segments"]["0"], "hello");
        assert_eq!(artifact.data["segments"]["1"], "world");
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let store = MemoryStore::new();
        store
            .create_meeting(&Meeting::new("m1", MeetingMode::Realtime, None))
            .await
            .unwrap();

        assert!(store.set_finalized("m1").await.unwrap());
        assert!(!store.set_finalized("m1").await.unwrap());
    }
}
