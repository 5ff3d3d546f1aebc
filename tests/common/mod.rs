//! Shared fixtures for the integration tests: in-memory contexts,
//! scripted connector providers and request helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use base64::Engine as _;
use secrecy::SecretString;
use tokio::sync::Mutex;
use tower::ServiceExt;

use meetscribe::blob::MemoryBlobStore;
use meetscribe::config::{
    AuthConfig, AuthMode, BreakerConfig, BrokerKind, ConnectorConfig, Environment, JwtConfig,
    PipelineConfig, QueueConfig, QueueMode, ReconcileConfig, ServerConfig, Settings, StorageConfig,
    StorageMode, StoreKind,
};
use meetscribe::connector::{ConnectorProvider, ProviderChunk};
use meetscribe::engine::AppContext;
use meetscribe::error::ConnectorError;
use meetscribe::queue::MemoryBroker;
use meetscribe::store::MemoryStore;

pub fn test_settings() -> Settings {
    Settings {
        env: Environment::Development,
        fail_fast: false,
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        auth: AuthConfig {
            mode: AuthMode::None,
            user_api_keys: Vec::new(),
            service_api_keys: Vec::new(),
            jwt: JwtConfig {
                issuer: String::new(),
                audience: String::new(),
                jwks_url: String::new(),
                hs256_secret: None,
                tenant_claim: "tenant".to_string(),
                scope_admin_read: "admin.read".to_string(),
                scope_admin_write: "admin.write".to_string(),
                scope_ws_internal: "ws.internal".to_string(),
                service_api_key_fallback: false,
            },
            tenant_enforcement: false,
            audit_persist: false,
        },
        queue: QueueConfig {
            mode: QueueMode::Inline,
            broker: BrokerKind::Memory,
            visibility_timeout: Duration::from_secs(5),
            max_attempts: 3,
            base_backoff: Duration::from_millis(5),
            workers_per_stage: 1,
            drain_deadline: Duration::from_secs(2),
        },
        storage: StorageConfig {
            store: StoreKind::Memory,
            database_url: None,
            mode: StorageMode::Local,
            blob_root: PathBuf::from("./unused"),
        },
        connector: ConnectorConfig {
            enabled: false,
            provider: "meetbridge".to_string(),
            base_url: String::new(),
            token: None,
            timeout: Duration::from_secs(2),
            retries: 0,
            backoff: Duration::from_millis(5),
            retry_on_status: vec![429, 500, 502, 503, 504],
            op_lock_ttl: Duration::from_secs(5),
            join_idempotent_ttl: Duration::from_secs(300),
            live_pull_batch_limit: 8,
            live_pull_sessions_limit: 4,
            live_pull_fail_reconnect_threshold: 3,
            breaker: BreakerConfig {
                failure_threshold: 3,
                window: Duration::from_secs(60),
                open_for: Duration::from_millis(100),
                auto_reset_min_age: Duration::from_secs(600),
                self_heal: false,
            },
        },
        reconcile: ReconcileConfig {
            interval: Duration::from_millis(50),
            stale_after: Duration::from_secs(120),
            reconciliation_limit: 16,
            finalize_idle: Duration::from_secs(300),
        },
        pipeline: PipelineConfig {
            stt_provider: "local".to_string(),
            enhancer_provider: "local".to_string(),
            analytics_provider: "local".to_string(),
            delivery_provider: "log".to_string(),
            delivery_recipient: None,
        },
    }
}

pub fn api_key_settings() -> Settings {
    let mut settings = test_settings();
    settings.auth.mode = AuthMode::ApiKey;
    settings.auth.user_api_keys = vec![SecretString::from("user-key".to_string())];
    settings.auth.service_api_keys = vec![SecretString::from("service-key".to_string())];
    settings.auth.audit_persist = true;
    settings
}

pub fn memory_context(settings: Settings) -> Arc<AppContext> {
    AppContext::assemble(
        settings,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryBroker::new()),
        None,
    )
    .expect("context assembles")
}

pub fn connector_context(
    settings: Settings,
    provider: Arc<ScriptedConnector>,
) -> Arc<AppContext> {
    AppContext::assemble(
        settings,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryBlobStore::new()),
        Arc::new(MemoryBroker::new()),
        Some(provider),
    )
    .expect("context assembles")
}

/// Connector provider driven by scripted outcomes. Unscripted calls
/// succeed with deterministic values.
pub struct ScriptedConnector {
    pub join_calls: AtomicU32,
    pub fetch_calls: AtomicU32,
    pub leave_calls: AtomicU32,
    join_script: Mutex<VecDeque<Result<String, ConnectorError>>>,
    fetch_script: Mutex<VecDeque<Result<Vec<ProviderChunk>, ConnectorError>>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            join_calls: AtomicU32::new(0),
            fetch_calls: AtomicU32::new(0),
            leave_calls: AtomicU32::new(0),
            join_script: Mutex::new(VecDeque::new()),
            fetch_script: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn script_join(&self, result: Result<String, ConnectorError>) {
        self.join_script.lock().await.push_back(result);
    }

    pub async fn script_fetch(&self, result: Result<Vec<ProviderChunk>, ConnectorError>) {
        self.fetch_script.lock().await.push_back(result);
    }
}

#[async_trait]
impl ConnectorProvider for ScriptedConnector {
    fn name(&self) -> &str {
        "meetbridge"
    }

    async fn join(&self, meeting_id: &str) -> Result<String, ConnectorError> {
        let n = self.join_calls.fetch_add(1, Ordering::SeqCst);
        match self.join_script.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(format!("ref-{meeting_id}-{n}")),
        }
    }

    async fn leave(&self, _provider_ref: &str) -> Result<(), ConnectorError> {
        self.leave_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_chunks(
        &self,
        _provider_ref: &str,
        _limit: usize,
    ) -> Result<Vec<ProviderChunk>, ConnectorError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        match self.fetch_script.lock().await.pop_front() {
            Some(result) => result,
            None => Ok(Vec::new()),
        }
    }

    async fn health(&self, _provider_ref: &str) -> Result<(), ConnectorError> {
        Ok(())
    }
}

pub fn chunk_b64(text: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(text.as_bytes())
}

// --- Router request helpers ---

pub async fn send_json(
    router: &Router,
    method: &str,
    path: &str,
    body: serde_json::Value,
    headers: &[(&str, &str)],
) -> Response<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder
        .body(Body::from(body.to_string()))
        .expect("request builds");
    router.clone().oneshot(request).await.expect("router responds")
}

pub async fn send_empty(
    router: &Router,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::empty()).expect("request builds");
    router.clone().oneshot(request).await.expect("router responds")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

pub fn assert_status(response: &Response<Body>, expected: StatusCode) {
    assert_eq!(response.status(), expected);
}
