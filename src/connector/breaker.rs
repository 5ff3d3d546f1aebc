//! Circuit breaker for provider calls.
//!
//! Classic three-state breaker with a fixed failure window: the first
//! failure stamps the window start, failures inside the window
//! accumulate, and hitting the threshold opens the circuit. While open
//! every call fails fast; after the open interval one probe is allowed
//! through, and its outcome decides between closing and re-opening.
//!
//! Circuit-open failures are surfaced as their own error variant and do
//! not feed back into the failure count.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::BreakerConfig;
use crate::error::ConnectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
    last_failure_reason: Option<String>,
    /// Terminal failures (auth, bad request) should not be healed away
    /// by the reconciler; only an operator reset clears them.
    last_failure_terminal: bool,
    last_reset_at: Option<DateTime<Utc>>,
    last_reset_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub last_reset_reason: Option<String>,
}

pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(provider: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                window_start: None,
                opened_at: None,
                opened_at_wall: None,
                probe_in_flight: false,
                last_failure_reason: None,
                last_failure_terminal: false,
                last_reset_at: None,
                last_reset_reason: None,
            }),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Gate a provider call. `Ok` means go ahead (and, in half-open,
    /// that this call is the probe).
    pub async fn allow(&self) -> Result<(), ConnectorError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_for {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(provider = %self.provider, "circuit half-open, probing");
                    Ok(())
                } else {
                    Err(ConnectorError::CircuitOpen(self.provider.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ConnectorError::CircuitOpen(self.provider.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            tracing::info!(provider = %self.provider, "circuit closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.window_start = None;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.probe_in_flight = false;
    }

    pub async fn record_failure(&self, reason: &str, terminal: bool) {
        let mut inner = self.inner.lock().await;
        inner.last_failure_reason = Some(reason.to_string());
        inner.last_failure_terminal = terminal;

        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.opened_at_wall = Some(Utc::now());
                inner.probe_in_flight = false;
                tracing::warn!(provider = %self.provider, "probe failed, circuit re-opened");
            }
            BreakerState::Closed => {
                let now = Instant::now();
                let in_window = inner
                    .window_start
                    .is_some_and(|start| now.duration_since(start) < self.config.window);
                if in_window {
                    inner.failure_count += 1;
                } else {
                    inner.window_start = Some(now);
                    inner.failure_count = 1;
                }

                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    inner.opened_at_wall = Some(Utc::now());
                    tracing::warn!(
                        provider = %self.provider,
                        failures = inner.failure_count,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Manual or self-heal reset. Every reset records who and why.
    pub async fn reset(&self, source: &str, reason: &str) {
        let mut inner = self.inner.lock().await;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.window_start = None;
        inner.opened_at = None;
        inner.opened_at_wall = None;
        inner.probe_in_flight = false;
        inner.last_reset_at = Some(Utc::now());
        inner.last_reset_reason = Some(format!("{source}: {reason}"));
        tracing::info!(provider = %self.provider, source, reason, "circuit breaker reset");
    }

    /// Whether the self-heal path may reset this breaker: open long
    /// enough, and the last failure was not a terminal category.
    pub async fn self_heal_eligible(&self, min_age: Duration) -> bool {
        let inner = self.inner.lock().await;
        inner.state == BreakerState::Open
            && !inner.last_failure_terminal
            && inner.opened_at.is_some_and(|t| t.elapsed() >= min_age)
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            provider: self.provider.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            opened_at: inner.opened_at_wall,
            last_failure_reason: inner.last_failure_reason.clone(),
            last_reset_at: inner.last_reset_at,
            last_reset_reason: inner.last_reset_reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, window_ms: u64, open_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_millis(window_ms),
            open_for: Duration::from_millis(open_ms),
            auto_reset_min_age: Duration::from_secs(600),
            self_heal: false,
        }
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::new("bridge", config(3, 60_000, 50));
        for _ in 0..2 {
            breaker.record_failure("500", false).await;
            assert!(breaker.allow().await.is_ok());
        }
        breaker.record_failure("500", false).await;
        assert!(matches!(
            breaker.allow().await,
            Err(ConnectorError::CircuitOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_single_probe_after_open_interval() {
        let breaker = CircuitBreaker::new("bridge", config(1, 60_000, 20));
        breaker.record_failure("timeout", false).await;
        assert!(breaker.allow().await.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Exactly one probe allowed.
        assert!(breaker.allow().await.is_ok());
        assert!(breaker.allow().await.is_err());

        breaker.record_success().await;
        assert!(breaker.allow().await.is_ok());
        assert_eq!(breaker.snapshot().await.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new("bridge", config(1, 60_000, 20));
        breaker.record_failure("timeout", false).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(breaker.allow().await.is_ok());
        breaker.record_failure("timeout again", false).await;

        // Re-opened with a fresh timer.
        assert!(breaker.allow().await.is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.allow().await.is_ok());
    }

    #[tokio::test]
    async fn test_window_expiry_restarts_count() {
        let breaker = CircuitBreaker::new("bridge", config(2, 20, 1000));
        breaker.record_failure("500", false).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        // Outside the window: the count restarts at one.
        breaker.record_failure("500", false).await;
        assert!(breaker.allow().await.is_ok());
    }

    #[tokio::test]
    async fn test_self_heal_refuses_terminal_failures() {
        let breaker = CircuitBreaker::new("bridge", config(1, 60_000, 1));
        breaker.record_failure("401 unauthorized", true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!breaker.self_heal_eligible(Duration::ZERO).await);

        breaker.reset("operator", "credentials rotated").await;
        let snap = breaker.snapshot().await;
        assert_eq!(snap.state, BreakerState::Closed);
        assert!(snap.last_reset_reason.as_deref().unwrap().contains("operator"));
    }

    #[tokio::test]
    async fn test_self_heal_eligible_when_transient() {
        let breaker = CircuitBreaker::new("bridge", config(1, 60_000, 1_000_000));
        breaker.record_failure("503", false).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(breaker.self_heal_eligible(Duration::ZERO).await);
        assert!(!breaker.self_heal_eligible(Duration::from_secs(3600)).await);
    }
}
