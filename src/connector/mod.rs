//! Third-party conferencing connector.
//!
//! The connector joins a meeting on the server's behalf and pulls media
//! chunks back into the ingest path. Everything provider-specific hides
//! behind [`ConnectorProvider`]; the lifecycle manager, circuit breaker
//! and reconciliation loop are provider-agnostic.

mod breaker;
mod http;
mod lifecycle;
mod reconcile;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use http::HttpConnector;
pub use lifecycle::{ConnectorManager, JoinOutcome, LivePullReport};
pub use reconcile::{ReconcileReport, Reconciler, spawn_reconciler};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConnectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Joining,
    Connected,
    Disconnected,
    Leaving,
    Dead,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Dead)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Joining => write!(f, "joining"),
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Leaving => write!(f, "leaving"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "joining" => Ok(Self::Joining),
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            "leaving" => Ok(Self::Leaving),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown session state: {other}")),
        }
    }
}

/// Per-meeting session state over a provider.
///
/// At most one non-terminal session exists per `(meeting_id, provider)`;
/// the lifecycle manager enforces that under the operation lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSession {
    pub meeting_id: String,
    pub provider: String,
    pub state: SessionState,
    /// Opaque handle minted by the provider at join time.
    pub provider_ref: Option<String>,
    pub joined_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub consecutive_live_pull_failures: u32,
    pub last_error: Option<String>,
}

impl ConnectorSession {
    pub fn joining(meeting_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            meeting_id: meeting_id.into(),
            provider: provider.into(),
            state: SessionState::Joining,
            provider_ref: None,
            joined_at: None,
            last_seen: None,
            consecutive_live_pull_failures: 0,
            last_error: None,
        }
    }
}

/// A media chunk as handed back by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderChunk {
    /// Base64-encoded media payload.
    pub media_b64: String,
    /// Provider-side cursor, echoed for debugging only.
    #[serde(default)]
    pub cursor: Option<String>,
}

impl ProviderChunk {
    /// Decode and sanity-check the payload. Invalid chunks are counted
    /// by the caller, never propagated into the pipeline.
    pub fn decode(&self) -> Option<Vec<u8>> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.media_b64.as_bytes())
            .ok()?;
        if bytes.is_empty() { None } else { Some(bytes) }
    }
}

/// Adapter for one conferencing provider.
#[async_trait]
pub trait ConnectorProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Join the meeting; returns the provider's session handle.
    async fn join(&self, meeting_id: &str) -> Result<String, ConnectorError>;

    async fn leave(&self, provider_ref: &str) -> Result<(), ConnectorError>;

    /// Fetch up to `limit` chunks for a joined session.
    async fn fetch_chunks(
        &self,
        provider_ref: &str,
        limit: usize,
    ) -> Result<Vec<ProviderChunk>, ConnectorError>;

    /// Lightweight provider-side session health probe.
    async fn health(&self, provider_ref: &str) -> Result<(), ConnectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Connected.to_string(), "connected");
        assert_eq!(SessionState::Dead.to_string(), "dead");
        assert!(SessionState::Dead.is_terminal());
        assert!(!SessionState::Disconnected.is_terminal());
    }

    #[test]
    fn test_provider_chunk_decode() {
        let good = ProviderChunk {
            media_b64: "aGVsbG8=".to_string(),
            cursor: None,
        };
        assert_eq!(good.decode().as_deref(), Some(b"hello".as_ref()));

        let bad = ProviderChunk {
            media_b64: "!!not-base64!!".to_string(),
            cursor: None,
        };
        assert!(bad.decode().is_none());

        let empty = ProviderChunk {
            media_b64: String::new(),
            cursor: None,
        };
        assert!(empty.decode().is_none());
    }
}
