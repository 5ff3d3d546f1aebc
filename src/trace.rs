//! Trace context threaded through requests, job envelopes and workers.
//!
//! The representation is three opaque hex identifiers, not an SDK type.
//! `X-Trace-Id` (32 hex chars) is accepted at the HTTP edge, echoed on
//! responses, and propagated through queues so a meeting's chunks can be
//! followed across stages.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Header carrying the trace id at the HTTP edge.
pub const TRACE_HEADER: &str = "x-trace-id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    /// Start a fresh trace with a new root span.
    pub fn new_root() -> Self {
        Self {
            trace_id: random_hex(32),
            span_id: random_hex(16),
            parent_span_id: None,
        }
    }

    /// Adopt an externally supplied trace id (already validated).
    pub fn from_trace_id(trace_id: &str) -> Self {
        Self {
            trace_id: trace_id.to_string(),
            span_id: random_hex(16),
            parent_span_id: None,
        }
    }

    /// Derive a child span within the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_hex(16),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// Validate an incoming `X-Trace-Id` value: exactly 32 lowercase or
/// uppercase hex characters.
pub fn is_valid_trace_id(value: &str) -> bool {
    value.len() == 32 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            char::from_digit(n as u32, 16).unwrap_or('0')
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_trace_shape() {
        let t = TraceContext::new_root();
        assert_eq!(t.trace_id.len(), 32);
        assert_eq!(t.span_id.len(), 16);
        assert!(t.parent_span_id.is_none());
        assert!(is_valid_trace_id(&t.trace_id));
    }

    #[test]
    fn test_child_keeps_trace_id() {
        let root = TraceContext::new_root();
        let child = root.child();
        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
    }

    #[test]
    fn test_trace_id_validation() {
        assert!(is_valid_trace_id("0123456789abcdef0123456789abcdef"));
        assert!(!is_valid_trace_id("0123456789abcdef"));
        assert!(!is_valid_trace_id("0123456789abcdef0123456789abcdeg"));
    }
}
