//! Deterministic in-process providers.
//!
//! These back inline mode, local development and the test suite. They
//! are honest implementations of each capability, just without an
//! external service behind them: same inputs, same outputs, every time.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::providers::{
    DeliveryRequest, DeliverySink, ReportBuilder, ReportOutput, SttEngine, TranscriptEnhancer,
};

/// Treats chunk media as UTF-8 text. Useful stand-in when the real STT
/// engine is out of reach; feeding it text fixtures makes the whole
/// pipeline observable end to end.
pub struct LocalSttEngine;

#[async_trait]
impl SttEngine for LocalSttEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn transcribe(&self, media: &[u8]) -> Result<String, ProviderError> {
        if media.is_empty() {
            return Err(ProviderError::Rejected {
                provider: "stt/local".to_string(),
                reason: "empty media payload".to_string(),
            });
        }
        Ok(String::from_utf8_lossy(media).trim().to_string())
    }
}

/// Whitespace-normalizing enhancer: collapses runs of whitespace,
/// capitalizes sentence starts and guarantees terminal punctuation.
pub struct LocalEnhancer;

#[async_trait]
impl TranscriptEnhancer for LocalEnhancer {
    fn name(&self) -> &str {
        "local"
    }

    async fn enhance(&self, raw_transcript: &str) -> Result<String, ProviderError> {
        let collapsed = raw_transcript.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            return Ok(String::new());
        }

        let mut out = String::with_capacity(collapsed.len() + 1);
        let mut at_sentence_start = true;
        for c in collapsed.chars() {
            if at_sentence_start && c.is_alphabetic() {
                out.extend(c.to_uppercase());
                at_sentence_start = false;
            } else {
                out.push(c);
                if matches!(c, '.' | '!' | '?') {
                    at_sentence_start = true;
                }
            }
        }
        if !out.ends_with(['.', '!', '?']) {
            out.push('.');
        }
        Ok(out)
    }
}

/// Builds a summary report plus a scorecard from simple text statistics.
pub struct LocalReportBuilder;

#[async_trait]
impl ReportBuilder for LocalReportBuilder {
    fn name(&self) -> &str {
        "local"
    }

    async fn build(&self, enhanced_transcript: &str) -> Result<ReportOutput, ProviderError> {
        let words: Vec<&str> = enhanced_transcript.split_whitespace().collect();
        let sentence_count = enhanced_transcript
            .chars()
            .filter(|c| matches!(c, '.' | '!' | '?'))
            .count()
            .max(usize::from(!words.is_empty()));

        let summary: String = {
            let mut s: String = enhanced_transcript.chars().take(240).collect();
            if enhanced_transcript.chars().count() > 240 {
                s.push('…');
            }
            s
        };

        let avg_sentence_len = if sentence_count == 0 {
            0
        } else {
            words.len() / sentence_count
        };

        Ok(ReportOutput {
            report: serde_json::json!({
                "summary": summary,
                "word_count": words.len(),
                "sentence_count": sentence_count,
            }),
            scorecard: serde_json::json!({
                "avg_sentence_len": avg_sentence_len,
                "brevity": if words.len() < 2000 { "ok" } else { "long" },
            }),
        })
    }
}

/// Delivery sink that records the send in the log and calls it done.
pub struct LogDeliverySink;

#[async_trait]
impl DeliverySink for LogDeliverySink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, request: &DeliveryRequest) -> Result<(), ProviderError> {
        tracing::info!(
            recipient = %request.recipient,
            subject = %request.subject,
            attachments = request.attachments.len(),
            "report delivered (log sink)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_stt_round_trips_text() {
        let engine = LocalSttEngine;
        let text = engine.transcribe(b" hello there ").await.unwrap();
        assert_eq!(text, "hello there");
        assert!(engine.transcribe(b"").await.is_err());
    }

    #[tokio::test]
    async fn test_enhancer_is_deterministic() {
        let enhancer = LocalEnhancer;
        let a = enhancer.enhance("hello   world. how are\nyou").await.unwrap();
        let b = enhancer.enhance("hello   world. how are\nyou").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "Hello world. How are you.");
    }

    #[tokio::test]
    async fn test_report_builder_counts() {
        let builder = LocalReportBuilder;
        let out = builder.build("One two three. Four five.").await.unwrap();
        assert_eq!(out.report["word_count"], 5);
        assert_eq!(out.report["sentence_count"], 2);
        assert_eq!(out.scorecard["brevity"], "ok");
    }
}
