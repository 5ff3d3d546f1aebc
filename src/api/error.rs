//! JSON error responses.
//!
//! Every user-visible failure carries a stable `code` plus a human
//! `reason`. Domain errors map onto status codes here, in one place.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::{AuthError, BlobError, ConnectorError, PipelineError, QueueError, StoreError};

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub reason: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", reason)
    }

    pub fn not_found(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, reason)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "code": self.code, "reason": self.reason })),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::MeetingNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "meeting_not_found", e.to_string())
            }
            StoreError::AlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "meeting_exists", e.to_string())
            }
            StoreError::StatusRegression { .. } => {
                Self::new(StatusCode::CONFLICT, "status_conflict", e.to_string())
            }
            StoreError::DuplicateChunk { .. } => {
                Self::new(StatusCode::CONFLICT, "duplicate_chunk", e.to_string())
            }
            StoreError::Pool(_) | StoreError::Db(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                e.to_string(),
            ),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(e: BlobError) -> Self {
        match &e {
            BlobError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "blob_not_found", e.to_string())
            }
            BlobError::Io(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                e.to_string(),
            ),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match &e {
            QueueError::UnknownJob { .. } => {
                Self::new(StatusCode::NOT_FOUND, "job_not_found", e.to_string())
            }
            _ => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_unavailable",
                e.to_string(),
            ),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::MeetingNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, "meeting_not_found", e.to_string())
            }
            PipelineError::ArtifactMissing { .. } => {
                Self::new(StatusCode::NOT_FOUND, "artifact_missing", e.to_string())
            }
            PipelineError::InvalidPayload(_) => Self::bad_request(e.to_string()),
            PipelineError::Provider(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "provider_error", e.to_string())
            }
            PipelineError::Store(inner) => inner.into(),
            PipelineError::Blob(inner) => inner.into(),
            PipelineError::Queue(inner) => inner.into(),
        }
    }
}

impl From<ConnectorError> for ApiError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::Busy(_) => Self::new(StatusCode::CONFLICT, "busy", e.to_string()),
            ConnectorError::CircuitOpen(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "circuit_open",
                e.to_string(),
            ),
            ConnectorError::NoSession(_) => {
                Self::new(StatusCode::NOT_FOUND, "no_session", e.to_string())
            }
            ConnectorError::BadState { .. } => {
                Self::new(StatusCode::CONFLICT, "bad_session_state", e.to_string())
            }
            ConnectorError::Disabled => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "connector_disabled",
                e.to_string(),
            ),
            ConnectorError::Auth => {
                Self::new(StatusCode::BAD_GATEWAY, "provider_auth", e.to_string())
            }
            ConnectorError::BadRequest(_) | ConnectorError::InvalidResponse(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "provider_error", e.to_string())
            }
            ConnectorError::Unavailable(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "provider_unavailable",
                e.to_string(),
            ),
            ConnectorError::Store(inner) => inner.into(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match &e {
            AuthError::MissingCredentials => {
                Self::new(StatusCode::UNAUTHORIZED, "auth_required", e.to_string())
            }
            AuthError::InvalidCredentials | AuthError::Token(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "invalid_credentials", e.to_string())
            }
            AuthError::WrongContour => {
                Self::new(StatusCode::FORBIDDEN, "wrong_contour", e.to_string())
            }
            AuthError::MissingScope(_) => {
                Self::new(StatusCode::FORBIDDEN, "missing_scope", e.to_string())
            }
            AuthError::TenantRequired | AuthError::TenantMismatch => {
                Self::new(StatusCode::FORBIDDEN, "tenant_denied", e.to_string())
            }
            AuthError::Jwks(_) => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "jwks_unavailable",
                e.to_string(),
            ),
        }
    }
}
