//! Error types for every subsystem.
//!
//! Retryability is a property of the error, not the call site: workers and
//! the connector HTTP client ask the error whether another attempt can
//! succeed, and route to the DLQ or fail fast accordingly.

use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors from the relational store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("meeting not found: {0}")]
    MeetingNotFound(String),

    #[error("meeting already exists: {0}")]
    AlreadyExists(String),

    #[error("status cannot move backward from {from} to {to}")]
    StatusRegression { from: String, to: String },

    #[error("duplicate chunk seq {seq} for meeting {meeting_id}")]
    DuplicateChunk { meeting_id: String, seq: u64 },
}

impl StoreError {
    /// Pool and wire errors are transient; everything else is a
    /// client mistake or an invariant violation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Pool(_) | StoreError::Db(_))
    }
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Pool(e.to_string())
    }
}

/// Errors from the blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e.to_string())
    }
}

/// Errors from the queue broker.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),

    #[error("job {job_id} is not pending on queue {queue}")]
    UnknownJob { queue: String, job_id: uuid::Uuid },

    #[error("job serialization failed: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Codec(e.to_string())
    }
}

/// Errors from pluggable providers (STT, enhancer, analytics, delivery).
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider is down or overloaded; the call may succeed later.
    #[error("{provider} call failed: {reason}")]
    Failed { provider: String, reason: String },

    /// The provider rejected the input; retrying cannot help.
    #[error("{provider} rejected input: {reason}")]
    Rejected { provider: String, reason: String },
}

/// Errors raised by pipeline stage handlers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("meeting not found: {0}")]
    MeetingNotFound(String),

    #[error("artifact missing: {kind} for meeting {meeting_id}")]
    ArtifactMissing { meeting_id: String, kind: String },

    #[error("provider call failed: {0}")]
    Provider(String),

    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl From<ProviderError> for PipelineError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::Failed { .. } => PipelineError::Provider(e.to_string()),
            ProviderError::Rejected { .. } => PipelineError::InvalidPayload(e.to_string()),
        }
    }
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Provider(_) | PipelineError::Queue(_) => true,
            PipelineError::Store(e) => e.is_retryable(),
            PipelineError::Blob(e) => matches!(e, BlobError::Io(_)),
            PipelineError::MeetingNotFound(_)
            | PipelineError::ArtifactMissing { .. }
            | PipelineError::InvalidPayload(_) => false,
        }
    }
}

/// Errors from the connector lifecycle and its provider adapter.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("provider rejected credentials")]
    Auth,

    #[error("provider rejected request: {0}")]
    BadRequest(String),

    #[error("provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("circuit open for provider {0}")]
    CircuitOpen(String),

    #[error("operation already in progress for meeting {0}")]
    Busy(String),

    #[error("no session for meeting {0}")]
    NoSession(String),

    #[error("session in state {state} cannot {op}")]
    BadState { state: String, op: &'static str },

    #[error("connector is not configured")]
    Disabled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ConnectorError {
    /// Only provider unavailability is worth another attempt. Auth,
    /// malformed requests and malformed responses never self-correct,
    /// and circuit-open must fail fast without touching the provider.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::Unavailable(_))
    }
}

/// Authentication and authorization failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("credentials not valid on this contour")]
    WrongContour,

    #[error("missing scope: {0}")]
    MissingScope(String),

    #[error("tenant claim required")]
    TenantRequired,

    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("token rejected: {0}")]
    Token(String),

    #[error("jwks fetch failed: {0}")]
    Jwks(String),
}
