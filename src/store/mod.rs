//! Meeting store abstraction.
//!
//! Durable record of meetings, chunks, artifacts, idempotency keys,
//! connector sessions and audit events. Two implementations: Postgres
//! for deployments and an in-memory store for inline mode and tests.
//!
//! The one non-obvious contract lives here: **monotone status**. Any
//! write that would move a meeting's status backward is rejected unless
//! the caller is performing an explicit rebuild.

mod memory;
mod pg;

pub use memory::MemoryStore;
pub use pg::{PgStore, pg_pool};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::AuditEvent;
use crate::connector::ConnectorSession;
use crate::error::StoreError;
use crate::trace::TraceContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingMode {
    Batch,
    Realtime,
}

impl std::fmt::Display for MeetingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Batch => write!(f, "batch"),
            Self::Realtime => write!(f, "realtime"),
        }
    }
}

impl std::str::FromStr for MeetingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "batch" => Ok(Self::Batch),
            "realtime" => Ok(Self::Realtime),
            other => Err(format!("unknown meeting mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Created,
    Ingesting,
    Processing,
    Done,
    Failed,
}

impl MeetingStatus {
    /// Whether a status write from `self` to `to` is permitted.
    ///
    /// Forward moves are free; terminal states are frozen. The rebuild
    /// flag unlocks exactly one backward edge: a terminal meeting going
    /// back to `processing` for a re-run.
    pub fn can_transition(self, to: MeetingStatus, rebuild: bool) -> bool {
        use MeetingStatus::*;
        if self == to {
            return true;
        }
        if rebuild && matches!(self, Failed | Done) && to == Processing {
            return true;
        }
        match self {
            Created => matches!(to, Ingesting | Processing | Done | Failed),
            Ingesting => matches!(to, Processing | Done | Failed),
            Processing => matches!(to, Done | Failed),
            Done | Failed => false,
        }
    }
}

impl std::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Ingesting => write!(f, "ingesting"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MeetingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "ingesting" => Ok(Self::Ingesting),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown meeting status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub meeting_id: String,
    pub tenant: Option<String>,
    pub mode: MeetingMode,
    pub status: MeetingStatus,
    pub created_at: DateTime<Utc>,
    pub connector_provider: Option<String>,
    /// Bumped by rebuild; part of every idempotency key.
    pub epoch: i64,
    pub finalized_at: Option<DateTime<Utc>>,
    pub last_chunk_at: Option<DateTime<Utc>>,
    pub delivery_recipient: Option<String>,
}

impl Meeting {
    pub fn new(meeting_id: impl Into<String>, mode: MeetingMode, tenant: Option<String>) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            tenant,
            mode,
            status: MeetingStatus::Created,
            created_at: Utc::now(),
            connector_provider: None,
            epoch: 0,
            finalized_at: None,
            last_chunk_at: None,
            delivery_recipient: None,
        }
    }
}

/// One ingested fragment of meeting media. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub meeting_id: String,
    pub chunk_seq: u64,
    /// Reference into the blob store; the payload never lives here.
    pub media_ref: String,
    pub received_at: DateTime<Utc>,
    pub trace: TraceContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    RawTranscript,
    EnhancedTranscript,
    Report,
    Scorecard,
    Comparison,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::RawTranscript,
        ArtifactKind::EnhancedTranscript,
        ArtifactKind::Report,
        ArtifactKind::Scorecard,
        ArtifactKind::Comparison,
    ];

    /// Artifacts produced by the enhancer stage and later. Rebuild
    /// clears these before re-running.
    pub const DOWNSTREAM_OF_STT: [ArtifactKind; 4] = [
        ArtifactKind::EnhancedTranscript,
        ArtifactKind::Report,
        ArtifactKind::Scorecard,
        ArtifactKind::Comparison,
    ];
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RawTranscript => write!(f, "raw_transcript"),
            Self::EnhancedTranscript => write!(f, "enhanced_transcript"),
            Self::Report => write!(f, "report"),
            Self::Scorecard => write!(f, "scorecard"),
            Self::Comparison => write!(f, "comparison"),
        }
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw_transcript" => Ok(Self::RawTranscript),
            "enhanced_transcript" => Ok(Self::EnhancedTranscript),
            "report" => Ok(Self::Report),
            "scorecard" => Ok(Self::Scorecard),
            "comparison" => Ok(Self::Comparison),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub meeting_id: String,
    pub kind: ArtifactKind,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Durable storage for everything the pipeline and connector touch.
///
/// Implementations serialize chunk-seq assignment and artifact writes
/// per meeting internally (advisory lock in Postgres, per-meeting mutex
/// in memory), so callers never hold a lock handle across await points.
#[async_trait]
pub trait MeetingStore: Send + Sync {
    // --- Meetings ---

    async fn create_meeting(&self, meeting: &Meeting) -> Result<(), StoreError>;

    async fn get_meeting(&self, meeting_id: &str) -> Result<Option<Meeting>, StoreError>;

    /// Write a status, enforcing the monotone-status contract.
    async fn set_status(
        &self,
        meeting_id: &str,
        status: MeetingStatus,
        rebuild: bool,
    ) -> Result<(), StoreError>;

    async fn bind_connector(&self, meeting_id: &str, provider: &str) -> Result<(), StoreError>;

    /// Mark the meeting finalized. Returns false if it already was.
    async fn set_finalized(&self, meeting_id: &str) -> Result<bool, StoreError>;

    /// Bump the rebuild epoch and return the new value.
    async fn bump_epoch(&self, meeting_id: &str) -> Result<i64, StoreError>;

    /// Ingesting meetings whose last chunk predates `idle_before` and
    /// that are not finalized yet. Feeds the inactivity finalizer.
    async fn idle_unfinalized(
        &self,
        idle_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    // --- Chunks ---

    /// Atomically allocate the next chunk sequence number.
    async fn allocate_chunk_seq(&self, meeting_id: &str) -> Result<u64, StoreError>;

    async fn insert_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError>;

    async fn chunk_count(&self, meeting_id: &str) -> Result<u64, StoreError>;

    async fn get_chunk(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
    ) -> Result<Option<ChunkRecord>, StoreError>;

    // --- Artifacts ---

    /// Write-wins upsert, serialized per meeting.
    async fn put_artifact(
        &self,
        meeting_id: &str,
        kind: ArtifactKind,
        data: &serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Merge one transcript segment into the raw transcript artifact,
    /// keyed by chunk seq. Returns the segment count after the merge.
    async fn merge_transcript_segment(
        &self,
        meeting_id: &str,
        chunk_seq: u64,
        text: &str,
    ) -> Result<u64, StoreError>;

    async fn get_artifact(
        &self,
        meeting_id: &str,
        kind: ArtifactKind,
    ) -> Result<Option<Artifact>, StoreError>;

    async fn clear_artifacts(
        &self,
        meeting_id: &str,
        kinds: &[ArtifactKind],
    ) -> Result<(), StoreError>;

    // --- Idempotency ---

    async fn idempotency_get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn idempotency_put(
        &self,
        key: &str,
        result: &serde_json::Value,
    ) -> Result<(), StoreError>;

    // --- Connector sessions ---

    async fn upsert_session(&self, session: &ConnectorSession) -> Result<(), StoreError>;

    async fn get_session(
        &self,
        meeting_id: &str,
        provider: &str,
    ) -> Result<Option<ConnectorSession>, StoreError>;

    async fn delete_session(&self, meeting_id: &str, provider: &str) -> Result<(), StoreError>;

    async fn list_sessions(&self, provider: &str) -> Result<Vec<ConnectorSession>, StoreError>;

    /// Connected sessions whose `last_seen` predates `seen_before`.
    async fn stale_connected_sessions(
        &self,
        provider: &str,
        seen_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ConnectorSession>, StoreError>;

    // --- Audit ---

    async fn append_audit(&self, event: &AuditEvent) -> Result<(), StoreError>;

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEvent>, StoreError>;

    // --- Health ---

    async fn ping(&self) -> Result<(), StoreError>;
}
