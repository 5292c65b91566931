//! Breakwater metrics definitions.
//!
//! All metrics use OpenTelemetry conventions and are fed from guard events,
//! so they can be exported via OTLP to Prometheus, Grafana, Datadog, etc.

use opentelemetry::{
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};

use breakwater_core::events::{EventKind, EventSink, GuardEvent};

/// Central metrics handle for Breakwater.
#[derive(Clone)]
pub struct GuardMetrics {
    pub calls: Counter<u64>,
    pub rejections: Counter<u64>,
    pub state_changes: Counter<u64>,
    pub threshold_updates: Counter<u64>,
    pub config_changes: Counter<u64>,
    pub call_duration_ms: Histogram<f64>,
    pub bulkhead_queue_depth: Histogram<u64>,
}

impl GuardMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            calls: meter
                .u64_counter("breakwater.calls")
                .with_description("Guarded calls that ran, by outcome")
                .build(),
            rejections: meter
                .u64_counter("breakwater.rejections")
                .with_description("Calls refused before any work ran")
                .build(),
            state_changes: meter
                .u64_counter("breakwater.state_changes")
                .with_description("Circuit state transitions")
                .build(),
            threshold_updates: meter
                .u64_counter("breakwater.threshold_updates")
                .with_description("Failure thresholds changed by the adaptive controller")
                .build(),
            config_changes: meter
                .u64_counter("breakwater.config_changes")
                .with_description("Committed endpoint config versions")
                .build(),
            call_duration_ms: meter
                .f64_histogram("breakwater.call_duration_ms")
                .with_description("Time spent in protected work in milliseconds")
                .build(),
            bulkhead_queue_depth: meter
                .u64_histogram("breakwater.bulkhead_queue_depth")
                .with_description("Queue depth seen by requests that had to wait")
                .build(),
        }
    }

    pub fn record_call(&self, endpoint: &str, outcome: &'static str, duration_ms: u64) {
        let attrs = [
            KeyValue::new("endpoint", endpoint.to_string()),
            KeyValue::new("outcome", outcome),
        ];
        self.calls.add(1, &attrs);
        self.call_duration_ms.record(duration_ms as f64, &attrs);
    }

    pub fn record_rejection(&self, endpoint: &str, reason: &str) {
        self.rejections.add(
            1,
            &[
                KeyValue::new("endpoint", endpoint.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
    }

    fn record_config_change(&self, endpoint: &str, change: &'static str) {
        self.config_changes.add(
            1,
            &[
                KeyValue::new("endpoint", endpoint.to_string()),
                KeyValue::new("change", change),
            ],
        );
    }
}

impl EventSink for GuardMetrics {
    fn emit(&self, event: &GuardEvent) {
        let endpoint = event.endpoint.as_str();
        match &event.kind {
            EventKind::CallSuccess { duration_ms } => {
                self.record_call(endpoint, "success", *duration_ms)
            }
            EventKind::CallFailure { duration_ms, .. } => {
                self.record_call(endpoint, "failure", *duration_ms)
            }
            EventKind::CallTimeout { duration_ms } => {
                self.record_call(endpoint, "timeout", *duration_ms)
            }
            EventKind::CallRejected { reason } => self.record_rejection(endpoint, reason),
            EventKind::StateChange { from, to } => self.state_changes.add(
                1,
                &[
                    KeyValue::new("endpoint", endpoint.to_string()),
                    KeyValue::new("from", from.to_string()),
                    KeyValue::new("to", to.to_string()),
                ],
            ),
            EventKind::ThresholdUpdate { old, new, .. } => {
                let direction = if new > old { "raised" } else { "lowered" };
                self.threshold_updates.add(
                    1,
                    &[
                        KeyValue::new("endpoint", endpoint.to_string()),
                        KeyValue::new("direction", direction),
                    ],
                );
            }
            EventKind::BulkheadQueued { queue_depth } => self.bulkhead_queue_depth.record(
                *queue_depth as u64,
                &[KeyValue::new("endpoint", endpoint.to_string())],
            ),
            EventKind::ConfigUpdated { .. }
            | EventKind::ProfileApplied { .. }
            | EventKind::ConfigRollback { .. }
            | EventKind::ConfigReset { .. } => {
                self.record_config_change(endpoint, event.kind.name())
            }
            // Rejections are counted once, from `call_rejected`.
            EventKind::CircuitCreated
            | EventKind::BulkheadAccepted
            | EventKind::BulkheadRejected { .. }
            | EventKind::BulkheadTimeout { .. } => {}
        }
    }
}

impl std::fmt::Debug for GuardMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use breakwater_core::events::{FanoutSink, MemorySink};
    use breakwater_core::{CallOptions, Guard, GuardSettings};

    use super::*;

    #[tokio::test]
    async fn works_as_a_guard_sink() {
        let metrics = Arc::new(GuardMetrics::new(&opentelemetry::global::meter("breakwater-test")));
        let memory = Arc::new(MemorySink::new());
        let sinks: Vec<Arc<dyn EventSink>> = vec![metrics, memory.clone()];
        let sink = FanoutSink::new(sinks);
        let guard = Guard::with_sink(GuardSettings::default(), Arc::new(sink)).unwrap();

        guard
            .execute("svc", || async { Ok::<_, std::io::Error>(1) }, CallOptions::default())
            .await
            .unwrap();
        guard.apply_profile("svc", "balanced").unwrap();
        guard.rollback("svc").unwrap();

        assert_eq!(memory.count("svc", "call_success"), 1);
        assert_eq!(memory.count("svc", "profile_applied"), 1);
        assert_eq!(memory.count("svc", "config_rollback"), 1);
    }
}
