//! Metric surface for the pipeline workers and queue fabric.
//!
//! Counters and latency sums per stage, kept as plain atomics. Exporters
//! are out of scope; the admin surface reads snapshots and the numbers
//! land in structured logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct StageMetrics {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    latency_ms_total: AtomicU64,
    latency_count: AtomicU64,
}

impl StageMetrics {
    pub fn observe_latency(&self, elapsed: Duration) {
        self.latency_ms_total
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StageSnapshot {
        let count = self.latency_count.load(Ordering::Relaxed);
        let total = self.latency_ms_total.load(Ordering::Relaxed);
        StageSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            avg_latency_ms: if count == 0 { 0 } else { total / count },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub avg_latency_ms: u64,
}

/// Process-wide metric registry, built once at startup and shared.
#[derive(Debug, Default)]
pub struct Metrics {
    pub stt: StageMetrics,
    pub enhancer: StageMetrics,
    pub analytics: StageMetrics,
    pub delivery: StageMetrics,
    pub chunks_ingested: AtomicU64,
    pub live_pull_invalid_chunks: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&self, queue: &str) -> Option<&StageMetrics> {
        match queue {
            "q:stt" => Some(&self.stt),
            "q:enhancer" => Some(&self.enhancer),
            "q:analytics" => Some(&self.analytics),
            "q:delivery" => Some(&self.delivery),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "stt": self.stt.snapshot(),
            "enhancer": self.enhancer.snapshot(),
            "analytics": self.analytics.snapshot(),
            "delivery": self.delivery.snapshot(),
            "chunks_ingested": self.chunks_ingested.load(Ordering::Relaxed),
            "live_pull_invalid_chunks": self.live_pull_invalid_chunks.load(Ordering::Relaxed),
        })
    }
}
