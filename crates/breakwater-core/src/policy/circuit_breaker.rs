//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      consecutive failures reach `failure_threshold`
//! - `Open` → `Half-Open`:   a call arrives after `reset_timeout` has elapsed
//!   since the last failure; that call is admitted as a trial
//! - `Half-Open` → `Closed`: `success_threshold` consecutive successes
//! - `Half-Open` → `Open`:   any failure
//!
//! The Open → Half-Open check is lazy: it happens in [`CircuitBreaker::try_acquire`],
//! not on a timer. A circuit that sees no traffic while open keeps reporting
//! `Open` until the next call arrives.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitConfig;
use crate::lock::lock;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Normal operation.
    Closed,
    /// All requests rejected until `reset_timeout` has passed.
    Open,
    /// Trial requests allowed to test endpoint health.
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A state change caused by a permission check or an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitStatus,
    pub to: CircuitStatus,
}

/// Result of asking the circuit for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed, or already half-open.
    Allowed,
    /// The reset timeout just elapsed; the circuit moved Open → Half-Open
    /// and this call is the trial.
    Trial,
    /// Open — do not call.
    Rejected,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        self != Self::Rejected
    }
}

/// Point-in-time view of a circuit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure.
    pub since_last_failure_ms: Option<u64>,
    /// While open: milliseconds until a trial call will be admitted.
    pub retry_in_ms: Option<u64>,
    /// Number of times the circuit has opened.
    pub total_trips: u64,
    pub config: CircuitConfig,
}

struct CircuitInner {
    status: CircuitStatus,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    total_trips: u64,
    config: CircuitConfig,
}

impl CircuitInner {
    fn new(config: CircuitConfig) -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            total_trips: 0,
            config,
        }
    }

    fn move_to(&mut self, to: CircuitStatus) -> Transition {
        let from = std::mem::replace(&mut self.status, to);
        Transition { from, to }
    }
}

/// Thread-safe circuit breaker for a single endpoint.
///
/// All mutations for one endpoint are serialized through one mutex; distinct
/// endpoints own distinct breakers and never contend.
pub struct CircuitBreaker {
    name: String,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(CircuitInner::new(config)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status without triggering the lazy Open → Half-Open check.
    pub fn status(&self) -> CircuitStatus {
        lock(&self.inner).status
    }

    pub fn config(&self) -> CircuitConfig {
        lock(&self.inner).config
    }

    /// Decide whether a call may proceed right now.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = lock(&self.inner);
        match inner.status {
            CircuitStatus::Closed | CircuitStatus::HalfOpen => Admission::Allowed,
            CircuitStatus::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= inner.config.reset_timeout {
                    inner.move_to(CircuitStatus::HalfOpen);
                    inner.success_count = 0;
                    tracing::info!(endpoint = %self.name, "circuit breaker → half_open");
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) -> Option<Transition> {
        let mut inner = lock(&self.inner);
        match inner.status {
            CircuitStatus::Closed => {
                inner.failure_count = 0;
                None
            }
            CircuitStatus::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= inner.config.success_threshold {
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    tracing::info!(endpoint = %self.name, "circuit breaker → closed");
                    Some(inner.move_to(CircuitStatus::Closed))
                } else {
                    None
                }
            }
            // A call admitted before the circuit opened finished late.
            CircuitStatus::Open => None,
        }
    }

    /// Record a failed or timed-out call.
    pub fn record_failure(&self) -> Option<Transition> {
        let mut inner = lock(&self.inner);
        match inner.status {
            CircuitStatus::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= inner.config.failure_threshold {
                    inner.last_failure = Some(Instant::now());
                    inner.success_count = 0;
                    inner.total_trips += 1;
                    tracing::warn!(
                        endpoint = %self.name,
                        failures = inner.failure_count,
                        "circuit breaker → open"
                    );
                    Some(inner.move_to(CircuitStatus::Open))
                } else {
                    inner.last_failure = Some(Instant::now());
                    None
                }
            }
            CircuitStatus::HalfOpen => {
                inner.last_failure = Some(Instant::now());
                inner.success_count = 0;
                inner.total_trips += 1;
                tracing::warn!(endpoint = %self.name, "circuit breaker trial failed → open");
                Some(inner.move_to(CircuitStatus::Open))
            }
            CircuitStatus::Open => None,
        }
    }

    /// Replace the live config. Counters and status are left alone; a lowered
    /// threshold takes effect on the next failure.
    pub fn set_config(&self, config: CircuitConfig) {
        lock(&self.inner).config = config;
    }

    /// Force the circuit back to `Closed` with zeroed counters.
    pub fn reset(&self) -> Option<Transition> {
        let mut inner = lock(&self.inner);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        if inner.status == CircuitStatus::Closed {
            None
        } else {
            Some(inner.move_to(CircuitStatus::Closed))
        }
    }

    /// Time since the last recorded failure, if any.
    pub fn since_last_failure(&self) -> Option<Duration> {
        lock(&self.inner).last_failure.map(|t| t.elapsed())
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = lock(&self.inner);
        let since = inner.last_failure.map(|t| t.elapsed());
        let retry_in = match (inner.status, since) {
            (CircuitStatus::Open, Some(since)) => {
                Some(inner.config.reset_timeout.saturating_sub(since))
            }
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            status: inner.status,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            since_last_failure_ms: since.map(|d| d.as_millis() as u64),
            retry_in_ms: retry_in.map(|d| d.as_millis() as u64),
            total_trips: inner.total_trips,
            config: inner.config,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "svc",
            CircuitConfig {
                failure_threshold,
                success_threshold,
                reset_timeout: Duration::from_secs(30),
                call_timeout: Duration::from_secs(5),
            },
        )
    }

    fn force_half_open(c: &CircuitBreaker) {
        let mut inner = lock(&c.inner);
        inner.status = CircuitStatus::HalfOpen;
        inner.success_count = 0;
    }

    #[test]
    fn starts_closed() {
        let c = cb(5, 1);
        assert_eq!(c.status(), CircuitStatus::Closed);
        assert_eq!(c.try_acquire(), Admission::Allowed);
        assert!(Admission::Allowed.is_allowed());
        assert!(Admission::Trial.is_allowed());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let c = cb(3, 1);
        assert!(c.record_failure().is_none());
        assert!(c.record_failure().is_none());
        let t = c.record_failure().unwrap();
        assert_eq!(t, Transition { from: CircuitStatus::Closed, to: CircuitStatus::Open });
        assert_eq!(c.try_acquire(), Admission::Rejected);
        assert!(!c.try_acquire().is_allowed());
        assert_eq!(c.snapshot().total_trips, 1);
    }

    #[test]
    fn success_resets_failure_count() {
        let c = cb(3, 1);
        c.record_failure();
        c.record_failure();
        c.record_success();
        c.record_failure();
        c.record_failure();
        assert_eq!(c.status(), CircuitStatus::Closed);
        assert_eq!(c.snapshot().failure_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_admitted_only_after_reset_timeout() {
        let c = cb(1, 1);
        c.record_failure();
        assert_eq!(c.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert_eq!(c.try_acquire(), Admission::Rejected);
        assert_eq!(c.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(c.try_acquire(), Admission::Trial);
        assert_eq!(c.status(), CircuitStatus::HalfOpen);
        assert_eq!(c.try_acquire(), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_open_circuit_stays_open_until_called() {
        let c = cb(1, 1);
        c.record_failure();
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(c.status(), CircuitStatus::Open);
        assert_eq!(c.snapshot().retry_in_ms, Some(0));
    }

    #[test]
    fn half_open_needs_success_threshold_to_close() {
        let c = cb(1, 3);
        c.record_failure();
        force_half_open(&c);

        assert!(c.record_success().is_none());
        assert!(c.record_success().is_none());
        let t = c.record_success().unwrap();
        assert_eq!(t.to, CircuitStatus::Closed);

        let snap = c.snapshot();
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[test]
    fn half_open_on_failure_reopens() {
        let c = cb(1, 3);
        c.record_failure();
        force_half_open(&c);

        c.record_success();
        let t = c.record_failure().unwrap();
        assert_eq!(t, Transition { from: CircuitStatus::HalfOpen, to: CircuitStatus::Open });
        assert_eq!(c.snapshot().success_count, 0);
        assert_eq!(c.try_acquire(), Admission::Rejected);
    }

    #[test]
    fn lowered_threshold_applies_on_next_failure() {
        let c = cb(5, 1);
        c.record_failure();
        c.record_failure();
        c.set_config(CircuitConfig { failure_threshold: 2, ..c.config() });
        assert_eq!(c.status(), CircuitStatus::Closed);
        assert!(c.record_failure().is_some());
        assert_eq!(c.status(), CircuitStatus::Open);
    }

    #[test]
    fn reset_closes() {
        let c = cb(1, 1);
        c.record_failure();
        let t = c.reset().unwrap();
        assert_eq!(t.from, CircuitStatus::Open);
        assert_eq!(c.try_acquire(), Admission::Allowed);
        assert!(c.since_last_failure().is_none());
        assert!(c.reset().is_none());
    }
}
