//! Environment-driven configuration.
//!
//! Every knob has a default suited to local development (memory store,
//! inline pipeline, auth off). Production deployments flip the switches
//! via environment variables; the readiness gate rejects combinations
//! that make no sense in production.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// How pipeline jobs move between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// All stages run synchronously in the request path. No retries.
    Inline,
    /// Jobs flow through the broker and are executed by workers.
    Broker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Postgres,
}

/// Blob storage placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Node-local filesystem. Forbidden in production.
    Local,
    /// Shared POSIX mount visible to every node.
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    ApiKey,
    Jwt,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
    /// Shared-secret fallback for development; JWKS wins when both are set.
    pub hs256_secret: Option<SecretString>,
    /// Claim carrying the tenant identifier.
    pub tenant_claim: String,
    pub scope_admin_read: String,
    pub scope_admin_write: String,
    pub scope_ws_internal: String,
    /// Allow service callers to fall back to API keys in jwt mode.
    /// Forced off in production.
    pub service_api_key_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub user_api_keys: Vec<SecretString>,
    pub service_api_keys: Vec<SecretString>,
    pub jwt: JwtConfig,
    pub tenant_enforcement: bool,
    /// Persist audit events to the store in addition to logging them.
    pub audit_persist: bool,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub mode: QueueMode,
    pub broker: BrokerKind,
    pub visibility_timeout: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub workers_per_stage: usize,
    pub drain_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub mode: StorageMode,
    pub blob_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub open_for: Duration,
    /// Reconciler may reset breakers older than this when self-heal is on.
    pub auto_reset_min_age: Duration,
    pub self_heal: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub enabled: bool,
    pub provider: String,
    pub base_url: String,
    pub token: Option<SecretString>,
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
    pub retry_on_status: Vec<u16>,
    pub op_lock_ttl: Duration,
    pub join_idempotent_ttl: Duration,
    pub live_pull_batch_limit: usize,
    pub live_pull_sessions_limit: usize,
    pub live_pull_fail_reconnect_threshold: u32,
    pub breaker: BreakerConfig,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Connected sessions without a heartbeat for this long get reconnected.
    pub stale_after: Duration,
    pub reconciliation_limit: usize,
    /// Meetings idle this long after their last chunk are auto-finalized.
    pub finalize_idle: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub stt_provider: String,
    pub enhancer_provider: String,
    pub analytics_provider: String,
    pub delivery_provider: String,
    /// Default delivery recipient; a meeting without one skips delivery.
    pub delivery_recipient: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub fail_fast: bool,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub connector: ConnectorConfig,
    pub reconcile: ReconcileConfig,
    pub pipeline: PipelineConfig,
}

impl Settings {
    /// Load settings from the environment (after `dotenvy` has run).
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = match get("APP_ENV").as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            _ => Environment::Development,
        };

        let queue_mode = match get("QUEUE_MODE").as_deref() {
            None | Some("inline") => QueueMode::Inline,
            Some("broker") | Some("worker") => QueueMode::Broker,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "QUEUE_MODE",
                    reason: format!("unknown mode {other:?}, expected inline or broker"),
                });
            }
        };

        let broker = match get("QUEUE_BROKER").as_deref() {
            None | Some("memory") => BrokerKind::Memory,
            Some("postgres") => BrokerKind::Postgres,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "QUEUE_BROKER",
                    reason: format!("unknown broker {other:?}"),
                });
            }
        };

        let store = match get("STORE").as_deref() {
            None | Some("memory") => StoreKind::Memory,
            Some("postgres") => StoreKind::Postgres,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORE",
                    reason: format!("unknown store {other:?}"),
                });
            }
        };

        let storage_mode = match get("STORAGE_MODE").as_deref() {
            None | Some("local") => StorageMode::Local,
            Some("shared") => StorageMode::Shared,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "STORAGE_MODE",
                    reason: format!("unknown storage mode {other:?}"),
                });
            }
        };

        let auth_mode = match get("AUTH_MODE").as_deref() {
            None | Some("none") => AuthMode::None,
            Some("api_key") => AuthMode::ApiKey,
            Some("jwt") => AuthMode::Jwt,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "AUTH_MODE",
                    reason: format!("unknown auth mode {other:?}"),
                });
            }
        };

        let retry_on_status = match get("CONNECTOR_RETRY_ON_STATUS") {
            Some(raw) => parse_status_list(&raw)?,
            None => vec![429, 500, 502, 503, 504],
        };

        Ok(Self {
            env,
            fail_fast: flag("READINESS_FAIL_FAST", env.is_production()),
            server: ServerConfig {
                host: get("HTTP_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parse("HTTP_PORT", 8080)?,
            },
            auth: AuthConfig {
                mode: auth_mode,
                user_api_keys: secret_list("USER_API_KEYS"),
                service_api_keys: secret_list("SERVICE_API_KEYS"),
                jwt: JwtConfig {
                    issuer: get("JWT_ISSUER").unwrap_or_default(),
                    audience: get("JWT_AUDIENCE").unwrap_or_default(),
                    jwks_url: get("JWT_JWKS_URL").unwrap_or_default(),
                    hs256_secret: get("JWT_HS256_SECRET").map(SecretString::from),
                    tenant_claim: get("JWT_TENANT_CLAIM").unwrap_or_else(|| "tenant".to_string()),
                    scope_admin_read: get("SCOPE_ADMIN_READ")
                        .unwrap_or_else(|| "admin.read".to_string()),
                    scope_admin_write: get("SCOPE_ADMIN_WRITE")
                        .unwrap_or_else(|| "admin.write".to_string()),
                    scope_ws_internal: get("SCOPE_WS_INTERNAL")
                        .unwrap_or_else(|| "ws.internal".to_string()),
                    service_api_key_fallback: flag("JWT_SERVICE_API_KEY_FALLBACK", true)
                        && !env.is_production(),
                },
                tenant_enforcement: flag("TENANT_ENFORCEMENT", false),
                audit_persist: flag("AUDIT_PERSIST", false),
            },
            queue: QueueConfig {
                mode: queue_mode,
                broker,
                visibility_timeout: secs("QUEUE_VISIBILITY_TIMEOUT_SEC", 60)?,
                max_attempts: parse("QUEUE_MAX_ATTEMPTS", 5)?,
                base_backoff: millis("QUEUE_BASE_BACKOFF_MS", 500)?,
                workers_per_stage: parse("QUEUE_WORKERS_PER_STAGE", 2)?,
                drain_deadline: secs("QUEUE_DRAIN_DEADLINE_SEC", 20)?,
            },
            storage: StorageConfig {
                store,
                database_url: get("DATABASE_URL"),
                mode: storage_mode,
                blob_root: get("BLOB_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/blobs")),
            },
            connector: ConnectorConfig {
                enabled: flag("CONNECTOR_ENABLED", false),
                provider: get("CONNECTOR_PROVIDER").unwrap_or_else(|| "meetbridge".to_string()),
                base_url: get("CONNECTOR_BASE_URL").unwrap_or_default(),
                token: get("CONNECTOR_TOKEN").map(SecretString::from),
                timeout: secs("CONNECTOR_TIMEOUT_SEC", 10)?,
                retries: parse("CONNECTOR_RETRIES", 3)?,
                backoff: millis("CONNECTOR_BACKOFF_MS", 250)?,
                retry_on_status,
                op_lock_ttl: secs("CONNECTOR_OP_LOCK_TTL_SEC", 30)?,
                join_idempotent_ttl: secs("CONNECTOR_JOIN_IDEMPOTENT_TTL_SEC", 300)?,
                live_pull_batch_limit: parse("LIVE_PULL_BATCH_LIMIT", 16)?,
                live_pull_sessions_limit: parse("LIVE_PULL_SESSIONS_LIMIT", 8)?,
                live_pull_fail_reconnect_threshold: parse("LIVE_PULL_FAIL_RECONNECT_THRESHOLD", 3)?,
                breaker: BreakerConfig {
                    failure_threshold: parse("CB_FAILURE_THRESHOLD", 5)?,
                    window: secs("CB_WINDOW_SEC", 60)?,
                    open_for: secs("CB_OPEN_SEC", 30)?,
                    auto_reset_min_age: secs("CB_AUTO_RESET_MIN_AGE_SEC", 600)?,
                    self_heal: flag("CB_SELF_HEAL", false),
                },
            },
            reconcile: ReconcileConfig {
                interval: secs("RECONCILE_INTERVAL_SEC", 30)?,
                stale_after: secs("RECONCILE_STALE_SEC", 120)?,
                reconciliation_limit: parse("RECONCILIATION_LIMIT", 16)?,
                finalize_idle: secs("FINALIZE_IDLE_SEC", 300)?,
            },
            pipeline: PipelineConfig {
                stt_provider: get("STT_PROVIDER").unwrap_or_else(|| "local".to_string()),
                enhancer_provider: get("ENHANCER_PROVIDER").unwrap_or_else(|| "local".to_string()),
                analytics_provider: get("ANALYTICS_PROVIDER")
                    .unwrap_or_else(|| "local".to_string()),
                delivery_provider: get("DELIVERY_PROVIDER").unwrap_or_else(|| "log".to_string()),
                delivery_recipient: get("DELIVERY_RECIPIENT"),
            },
        })
    }
}

fn get(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn flag(key: &'static str, default: bool) -> bool {
    match get(key) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match get(key) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("cannot parse {raw:?}"),
        }),
        None => Ok(default),
    }
}

fn secs(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse(key, default)?))
}

fn millis(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(parse(key, default)?))
}

fn secret_list(key: &str) -> Vec<SecretString> {
    get(key)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| SecretString::from(s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_status_list(raw: &str) -> Result<Vec<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::Invalid {
                key: "CONNECTOR_RETRY_ON_STATUS",
                reason: format!("bad status code {s:?}"),
            })
        })
        .collect()
}
