//! Pluggable providers for the pipeline's external collaborators.
//!
//! One capability, one trait, one method that matters. Concrete
//! implementations are selected at startup from configuration; nothing
//! is discovered at runtime.

mod local;

pub use local::{LocalEnhancer, LocalReportBuilder, LocalSttEngine, LogDeliverySink};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::{ConfigError, ProviderError};

/// Speech-to-text over one media chunk.
#[async_trait]
pub trait SttEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(&self, media: &[u8]) -> Result<String, ProviderError>;
}

/// Rewrites a raw transcript into a readable one.
#[async_trait]
pub trait TranscriptEnhancer: Send + Sync {
    fn name(&self) -> &str;

    async fn enhance(&self, raw_transcript: &str) -> Result<String, ProviderError>;
}

/// Output of the analytics stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOutput {
    pub report: serde_json::Value,
    pub scorecard: serde_json::Value,
}

/// Builds the analytics report from an enhanced transcript.
#[async_trait]
pub trait ReportBuilder: Send + Sync {
    fn name(&self) -> &str;

    async fn build(&self, enhanced_transcript: &str) -> Result<ReportOutput, ProviderError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Sends the finished report somewhere (typically email).
#[async_trait]
pub trait DeliverySink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, request: &DeliveryRequest) -> Result<(), ProviderError>;
}

/// Build the STT engine named in the configuration.
pub fn create_stt_engine(config: &PipelineConfig) -> Result<Arc<dyn SttEngine>, ConfigError> {
    match config.stt_provider.as_str() {
        "local" => Ok(Arc::new(LocalSttEngine)),
        other => Err(ConfigError::Invalid {
            key: "STT_PROVIDER",
            reason: format!("unknown provider {other:?}"),
        }),
    }
}

pub fn create_enhancer(
    config: &PipelineConfig,
) -> Result<Arc<dyn TranscriptEnhancer>, ConfigError> {
    match config.enhancer_provider.as_str() {
        "local" => Ok(Arc::new(LocalEnhancer)),
        other => Err(ConfigError::Invalid {
            key: "ENHANCER_PROVIDER",
            reason: format!("unknown provider {other:?}"),
        }),
    }
}

pub fn create_report_builder(
    config: &PipelineConfig,
) -> Result<Arc<dyn ReportBuilder>, ConfigError> {
    match config.analytics_provider.as_str() {
        "local" => Ok(Arc::new(LocalReportBuilder)),
        other => Err(ConfigError::Invalid {
            key: "ANALYTICS_PROVIDER",
            reason: format!("unknown provider {other:?}"),
        }),
    }
}

pub fn create_delivery_sink(
    config: &PipelineConfig,
) -> Result<Arc<dyn DeliverySink>, ConfigError> {
    match config.delivery_provider.as_str() {
        "log" => Ok(Arc::new(LogDeliverySink)),
        other => Err(ConfigError::Invalid {
            key: "DELIVERY_PROVIDER",
            reason: format!("unknown provider {other:?}"),
        }),
    }
}
