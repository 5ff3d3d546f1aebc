//! Security audit trail.
//!
//! Every authentication decision on every guarded endpoint emits one
//! event. Events always go to the structured log; persistence to the
//! store is optional and best-effort, so a slow database never blocks
//! the request path.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::MeetingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    Allow,
    Deny,
}

impl std::fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub subject: String,
    pub auth_type: String,
    pub decision: AuditDecision,
    pub reason: String,
}

/// Sink for audit events.
#[derive(Clone)]
pub struct AuditLog {
    store: Option<Arc<dyn MeetingStore>>,
}

impl AuditLog {
    /// Log-only audit sink.
    pub fn new() -> Self {
        Self { store: None }
    }

    /// Audit sink that also persists events.
    pub fn with_store(store: Arc<dyn MeetingStore>) -> Self {
        Self { store: Some(store) }
    }

    pub async fn emit(&self, event: AuditEvent) {
        match event.decision {
            AuditDecision::Allow => tracing::info!(
                target: "audit",
                endpoint = %event.endpoint,
                method = %event.method,
                subject = %event.subject,
                auth_type = %event.auth_type,
                decision = %event.decision,
                reason = %event.reason,
                "auth decision"
            ),
            AuditDecision::Deny => tracing::warn!(
                target: "audit",
                endpoint = %event.endpoint,
                method = %event.method,
                subject = %event.subject,
                auth_type = %event.auth_type,
                decision = %event.decision,
                reason = %event.reason,
                "auth decision"
            ),
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.append_audit(&event).await {
                tracing::error!("failed to persist audit event: {}", e);
            }
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
