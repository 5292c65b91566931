//! Event surface — everything the guard reports to observers.
//!
//! Components publish through an [`EventBus`], which stamps each event and
//! forwards it to the configured [`EventSink`]. Sinks are best-effort: a
//! panicking sink is logged and otherwise ignored so it can never fail a
//! request.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lock::lock;
use crate::policy::CircuitStatus;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    CircuitCreated,
    StateChange {
        from: CircuitStatus,
        to: CircuitStatus,
    },
    CallSuccess {
        duration_ms: u64,
    },
    CallFailure {
        duration_ms: u64,
        error: String,
    },
    CallTimeout {
        duration_ms: u64,
    },
    CallRejected {
        reason: String,
    },
    ThresholdUpdate {
        old: u32,
        new: u32,
        error_rate: f64,
    },
    BulkheadAccepted,
    BulkheadQueued {
        queue_depth: usize,
    },
    BulkheadRejected {
        reason: String,
    },
    BulkheadTimeout {
        waited_ms: u64,
    },
    ConfigUpdated {
        version: u64,
    },
    ProfileApplied {
        profile: String,
        version: u64,
    },
    ConfigRollback {
        version: u64,
        restored_version: u64,
    },
    ConfigReset {
        version: u64,
    },
}

impl EventKind {
    /// Stable snake_case event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CircuitCreated => "circuit_created",
            Self::StateChange { .. } => "state_change",
            Self::CallSuccess { .. } => "call_success",
            Self::CallFailure { .. } => "call_failure",
            Self::CallTimeout { .. } => "call_timeout",
            Self::CallRejected { .. } => "call_rejected",
            Self::ThresholdUpdate { .. } => "threshold_update",
            Self::BulkheadAccepted => "bulkhead_accepted",
            Self::BulkheadQueued { .. } => "bulkhead_queued",
            Self::BulkheadRejected { .. } => "bulkhead_rejected",
            Self::BulkheadTimeout { .. } => "bulkhead_timeout",
            Self::ConfigUpdated { .. } => "config_updated",
            Self::ProfileApplied { .. } => "profile_applied",
            Self::ConfigRollback { .. } => "config_rollback",
            Self::ConfigReset { .. } => "config_reset",
        }
    }
}

/// A single emitted event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuardEvent {
    pub endpoint: String,
    #[serde(flatten)]
    pub kind: EventKind,
    pub at: DateTime<Utc>,
}

/// Receiver of guard events.
///
/// Called synchronously on the request path; implementations must be cheap
/// and must not block.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: &GuardEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &GuardEvent) {
        match &event.kind {
            EventKind::StateChange { from, to } => {
                tracing::info!(endpoint = %event.endpoint, %from, %to, "circuit state change");
            }
            EventKind::ThresholdUpdate { old, new, error_rate } => {
                tracing::info!(
                    endpoint = %event.endpoint,
                    old,
                    new,
                    error_rate,
                    "failure threshold adapted"
                );
            }
            EventKind::CallRejected { reason } | EventKind::BulkheadRejected { reason } => {
                tracing::debug!(endpoint = %event.endpoint, reason = %reason, event = event.kind.name());
            }
            other => {
                tracing::trace!(endpoint = %event.endpoint, event = other.name(), details = ?other);
            }
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &GuardEvent) {}
}

/// Keeps every event in memory — handy for tests and debugging.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<GuardEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<GuardEvent> {
        lock(&self.events).clone()
    }

    /// Number of recorded events with the given name for `endpoint`.
    pub fn count(&self, endpoint: &str, name: &str) -> usize {
        lock(&self.events)
            .iter()
            .filter(|e| e.endpoint == endpoint && e.kind.name() == name)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &GuardEvent) {
        lock(&self.events).push(event.clone());
    }
}

/// Broadcasts each event to several sinks in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &GuardEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Cloneable publishing handle shared by all components.
#[derive(Clone)]
pub struct EventBus {
    sink: Arc<dyn EventSink>,
}

impl EventBus {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// Stamp and publish an event. Sink panics are contained here.
    pub fn emit(&self, endpoint: &str, kind: EventKind) {
        let event = GuardEvent {
            endpoint: endpoint.to_string(),
            kind,
            at: Utc::now(),
        };
        let sink = &self.sink;
        if panic::catch_unwind(AssertUnwindSafe(|| sink.emit(&event))).is_err() {
            tracing::error!(
                endpoint = %event.endpoint,
                event = event.kind.name(),
                "event sink panicked; event dropped"
            );
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}
