//! HTTP adapter for a conferencing provider.
//!
//! One resilience policy covers every call: bounded retries with
//! exponential backoff and jitter for transport errors and a
//! configurable retry-on-status set; auth, bad-request and
//! invalid-response categories bail out immediately.

use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;

use async_trait::async_trait;

use crate::config::ConnectorConfig;
use crate::connector::{ConnectorProvider, ProviderChunk};
use crate::error::{ConfigError, ConnectorError};
use crate::queue::retry_backoff;

pub struct HttpConnector {
    name: String,
    client: reqwest::Client,
    base_url: String,
    token: String,
    retries: u32,
    backoff: std::time::Duration,
    retry_on_status: Vec<u16>,
}

#[derive(Debug, Deserialize)]
struct JoinResponse {
    session_ref: String,
}

#[derive(Debug, Deserialize)]
struct ChunksResponse {
    chunks: Vec<ProviderChunk>,
}

impl HttpConnector {
    pub fn new(config: &ConnectorConfig) -> Result<Self, ConfigError> {
        let token = config
            .token
            .as_ref()
            .map(|t| t.expose_secret().to_string())
            .ok_or(ConfigError::Missing("CONNECTOR_TOKEN"))?;
        if config.base_url.is_empty() {
            return Err(ConfigError::Missing("CONNECTOR_BASE_URL"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::Invalid {
                key: "CONNECTOR_TIMEOUT_SEC",
                reason: e.to_string(),
            })?;

        Ok(Self {
            name: config.provider.clone(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            retries: config.retries,
            backoff: config.backoff,
            retry_on_status: config.retry_on_status.clone(),
        })
    }

    /// Send a request, retrying transport failures and retryable
    /// statuses, and classify everything else into the error taxonomy.
    async fn execute(&self, method: reqwest::Method, url: String) -> Result<reqwest::Response, ConnectorError> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .request(method.clone(), &url)
                .bearer_auth(&self.token)
                .send()
                .await;

            let retryable_failure = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                        return Err(ConnectorError::Auth);
                    }
                    if self.retry_on_status.contains(&status.as_u16()) {
                        ConnectorError::Unavailable(format!("provider returned {status}"))
                    } else if status.is_client_error() {
                        return Err(ConnectorError::BadRequest(format!(
                            "provider returned {status}"
                        )));
                    } else {
                        return Err(ConnectorError::Unavailable(format!(
                            "provider returned {status}"
                        )));
                    }
                }
                Err(e) => ConnectorError::Unavailable(e.to_string()),
            };

            if attempt >= self.retries {
                return Err(retryable_failure);
            }
            let delay = retry_backoff(self.backoff, attempt);
            tracing::debug!(
                provider = %self.name,
                url = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "provider call failed, backing off: {}", retryable_failure
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ConnectorError> {
        response
            .json()
            .await
            .map_err(|e| ConnectorError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ConnectorProvider for HttpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn join(&self, meeting_id: &str) -> Result<String, ConnectorError> {
        let url = format!("{}/v1/meetings/{}/join", self.base_url, meeting_id);
        let response = self.execute(reqwest::Method::POST, url).await?;
        let body: JoinResponse = self.parse(response).await?;
        if body.session_ref.is_empty() {
            return Err(ConnectorError::InvalidResponse(
                "join returned an empty session_ref".to_string(),
            ));
        }
        Ok(body.session_ref)
    }

    async fn leave(&self, provider_ref: &str) -> Result<(), ConnectorError> {
        let url = format!("{}/v1/sessions/{}/leave", self.base_url, provider_ref);
        self.execute(reqwest::Method::POST, url).await?;
        Ok(())
    }

    async fn fetch_chunks(
        &self,
        provider_ref: &str,
        limit: usize,
    ) -> Result<Vec<ProviderChunk>, ConnectorError> {
        let url = format!(
            "{}/v1/sessions/{}/chunks?limit={}",
            self.base_url, provider_ref, limit
        );
        let response = self.execute(reqwest::Method::GET, url).await?;
        let body: ChunksResponse = self.parse(response).await?;
        Ok(body.chunks)
    }

    async fn health(&self, provider_ref: &str) -> Result<(), ConnectorError> {
        let url = format!("{}/v1/sessions/{}/health", self.base_url, provider_ref);
        self.execute(reqwest::Method::GET, url).await?;
        Ok(())
    }
}
