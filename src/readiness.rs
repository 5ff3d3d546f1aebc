//! Startup readiness gate.
//!
//! Validates the configuration before the server takes traffic. In
//! production with fail-fast enabled, any error-severity issue aborts
//! the process with a non-zero exit; otherwise the report is exposed at
//! `GET /v1/admin/system/readiness` for probes and operators.

use serde::Serialize;

use crate::config::{AuthMode, BrokerKind, QueueMode, Settings, StorageMode, StoreKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessIssue {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReadinessReport {
    pub issues: Vec<ReadinessIssue>,
}

impl ReadinessReport {
    pub fn ready(&self) -> bool {
        !self.has_errors()
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    fn error(&mut self, code: &'static str, message: impl Into<String>) {
        self.issues.push(ReadinessIssue {
            severity: Severity::Error,
            code,
            message: message.into(),
        });
    }

    fn warning(&mut self, code: &'static str, message: impl Into<String>) {
        self.issues.push(ReadinessIssue {
            severity: Severity::Warning,
            code,
            message: message.into(),
        });
    }
}

/// Evaluate the configuration against the deployment guardrails.
pub fn evaluate(settings: &Settings) -> ReadinessReport {
    let mut report = ReadinessReport::default();
    let prod = settings.env.is_production();

    // Storage.
    if prod && settings.storage.mode == StorageMode::Local {
        report.error(
            "storage_mode_local",
            "STORAGE_MODE=local keeps media on one node; production requires shared storage",
        );
    }
    if settings.storage.store == StoreKind::Postgres && settings.storage.database_url.is_none() {
        report.error("database_url_missing", "STORE=postgres requires DATABASE_URL");
    }
    if prod && settings.storage.store == StoreKind::Memory {
        report.error(
            "store_memory",
            "STORE=memory loses all state on restart; production requires postgres",
        );
    }

    // Auth.
    if prod && settings.auth.mode == AuthMode::None {
        report.error("auth_none", "AUTH_MODE=none is not allowed in production");
    }
    if prod && settings.auth.mode == AuthMode::ApiKey {
        report.warning(
            "auth_api_key",
            "AUTH_MODE=api_key in production; consider jwt for per-subject identity",
        );
    }
    if settings.auth.mode == AuthMode::ApiKey
        && settings.auth.user_api_keys.is_empty()
        && settings.auth.service_api_keys.is_empty()
    {
        report.error(
            "api_keys_empty",
            "AUTH_MODE=api_key with no keys configured locks everyone out",
        );
    }
    if settings.auth.mode == AuthMode::Jwt {
        let jwt = &settings.auth.jwt;
        if jwt.issuer.is_empty() || jwt.audience.is_empty() {
            report.error(
                "jwt_incomplete",
                "AUTH_MODE=jwt requires JWT_ISSUER and JWT_AUDIENCE",
            );
        }
        if jwt.jwks_url.is_empty() && jwt.hs256_secret.is_none() {
            report.error(
                "jwt_no_keys",
                "AUTH_MODE=jwt requires JWT_JWKS_URL (or JWT_HS256_SECRET for development)",
            );
        }
        if prod && jwt.hs256_secret.is_some() {
            report.warning(
                "jwt_shared_secret",
                "JWT_HS256_SECRET is set in production; JWKS validation is preferred",
            );
        }
    }
    if settings.auth.tenant_enforcement && settings.auth.mode != AuthMode::Jwt {
        report.error(
            "tenancy_requires_jwt",
            "TENANT_ENFORCEMENT=true only works with AUTH_MODE=jwt",
        );
    }

    // Queue fabric.
    if prod && settings.queue.mode == QueueMode::Inline {
        report.warning(
            "queue_inline",
            "QUEUE_MODE=inline runs the pipeline in the request path; no retries, no workers",
        );
    }
    if settings.queue.mode == QueueMode::Broker
        && settings.queue.broker == BrokerKind::Postgres
        && settings.storage.database_url.is_none()
    {
        report.error(
            "broker_database_url_missing",
            "QUEUE_BROKER=postgres requires DATABASE_URL",
        );
    }
    if prod
        && settings.queue.mode == QueueMode::Broker
        && settings.queue.broker == BrokerKind::Memory
    {
        report.error(
            "broker_memory",
            "QUEUE_BROKER=memory cannot survive restarts; production requires postgres",
        );
    }

    // Connector.
    if settings.connector.enabled {
        let c = &settings.connector;
        if c.base_url.is_empty() {
            report.error("connector_base_url", "CONNECTOR_ENABLED requires CONNECTOR_BASE_URL");
        } else if prod && !c.base_url.starts_with("https://") {
            report.error(
                "connector_insecure",
                format!("connector base URL must be https in production, got {}", c.base_url),
            );
        }
        match &c.token {
            Some(token) if !secrecy::ExposeSecret::expose_secret(token).is_empty() => {}
            _ => report.error("connector_token", "CONNECTOR_ENABLED requires a non-empty CONNECTOR_TOKEN"),
        }
    }

    report
}
