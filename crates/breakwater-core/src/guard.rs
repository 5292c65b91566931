//! `Guard` — the facade callers use to run protected work.
//!
//! The guard stack (applied in order):
//! ```text
//! call → [CircuitBreaker] → [Bulkhead] → [timeout + catch_unwind] → work
//! ```
//!
//! Every outcome is reported to the endpoint's circuit, to telemetry and to
//! the event sink. The configuration manager is the only writer of live
//! config; the circuit and bulkhead registries subscribe to it.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;

use crate::config::{
    ConfigChanges, ConfigHistoryEntry, ConfigManager, ConfigSnapshot, EndpointConfig,
    GuardSettings, SettingsError,
};
use crate::error::{BoxError, GuardError};
use crate::events::{EventBus, EventKind, EventSink, TracingSink};
use crate::health::{self, EndpointHealth, SystemHealth};
use crate::policy::{
    AdaptationOutcome, AdaptiveController, AdaptiveHandle, AdaptiveMetrics, Admission,
    BulkheadRegistry, BulkheadSnapshot, CircuitBreaker, CircuitRegistry, CircuitSnapshot,
    CircuitStatus, Transition,
};
use crate::telemetry::{Outcome, Telemetry, TelemetrySnapshot};

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Replaces the endpoint's configured call timeout.
    pub timeout: Option<Duration>,
    /// Replaces the endpoint's configured bulkhead queue timeout.
    pub queue_timeout: Option<Duration>,
}

impl CallOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }
}

/// Circuit breaker + bulkhead + adaptive thresholds for named endpoints.
pub struct Guard {
    events: EventBus,
    config: Arc<ConfigManager>,
    circuits: Arc<CircuitRegistry>,
    bulkheads: Arc<BulkheadRegistry>,
    telemetry: Arc<Telemetry>,
    adaptive: Arc<AdaptiveController>,
}

impl Guard {
    /// Build a guard that logs events through `tracing`.
    pub fn new(settings: GuardSettings) -> Result<Self, SettingsError> {
        Self::with_sink(settings, Arc::new(TracingSink))
    }

    /// Build a guard that sends events to `sink`.
    pub fn with_sink(
        settings: GuardSettings,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;

        let events = EventBus::new(sink);
        let config = Arc::new(ConfigManager::new(
            settings.defaults,
            settings.max_history,
            events.clone(),
        ));
        let circuits = Arc::new(CircuitRegistry::new(events.clone()));
        let bulkheads = Arc::new(BulkheadRegistry::new(events.clone()));
        config.subscribe(circuits.clone());
        config.subscribe(bulkheads.clone());

        let telemetry = Arc::new(Telemetry::new(settings.sample_size));
        let adaptive = Arc::new(AdaptiveController::new(
            settings.adaptive,
            config.clone(),
            telemetry.clone(),
            events.clone(),
        ));

        let guard = Self {
            events,
            config,
            circuits,
            bulkheads,
            telemetry,
            adaptive,
        };
        guard.apply_settings(&settings)?;
        Ok(guard)
    }

    fn apply_settings(&self, settings: &GuardSettings) -> Result<(), SettingsError> {
        let invalid = |what: String, e: GuardError| SettingsError::Invalid(vec![format!("{what}: {e}")]);

        for (name, profile) in &settings.custom_profiles {
            self.config
                .register_profile(name, *profile)
                .map_err(|e| invalid(format!("profile {name}"), e))?;
        }
        for (endpoint, ov) in &settings.endpoints {
            if let Some(profile) = &ov.profile {
                self.config
                    .apply_profile(endpoint, profile)
                    .map_err(|e| invalid(format!("endpoint {endpoint}"), e))?;
            }
            if let Some(changes) = &ov.changes {
                self.config
                    .update(endpoint, changes)
                    .map_err(|e| invalid(format!("endpoint {endpoint}"), e))?;
            }
        }
        Ok(())
    }

    /// Run `work` behind the endpoint's circuit breaker.
    ///
    /// The work is not invoked if the circuit is open. Errors, panics and
    /// timeouts all count as failures.
    pub async fn execute<F, Fut, T, E>(
        &self,
        name: &str,
        work: F,
        opts: CallOptions,
    ) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let config = self.config.get_config(name);
        let circuit = self.circuits.get_or_create(name, &config.circuit);
        self.admit(name, &circuit)?;
        let timeout = opts.timeout.unwrap_or(config.circuit.call_timeout);
        self.run(name, &circuit, timeout, work).await
    }

    /// Like [`execute`](Self::execute), but the work also needs a bulkhead
    /// slot. The circuit is consulted first.
    pub async fn execute_with_bulkhead<F, Fut, T, E>(
        &self,
        name: &str,
        work: F,
        opts: CallOptions,
    ) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let config = self.config.get_config(name);
        let circuit = self.circuits.get_or_create(name, &config.circuit);
        self.admit(name, &circuit)?;

        let bulkhead = self.bulkheads.get_or_create(name, &config.bulkhead);
        let _permit = match bulkhead.acquire(opts.queue_timeout).await {
            Ok(permit) => permit,
            Err(e) => {
                self.reject(name, &e);
                return Err(e);
            }
        };

        let timeout = opts.timeout.unwrap_or(config.circuit.call_timeout);
        self.run(name, &circuit, timeout, work).await
    }

    fn admit(&self, name: &str, circuit: &CircuitBreaker) -> Result<(), GuardError> {
        match circuit.try_acquire() {
            Admission::Allowed => Ok(()),
            Admission::Trial => {
                self.on_transition(
                    name,
                    Some(Transition {
                        from: CircuitStatus::Open,
                        to: CircuitStatus::HalfOpen,
                    }),
                );
                Ok(())
            }
            Admission::Rejected => {
                let err = GuardError::CircuitOpen {
                    endpoint: name.to_string(),
                };
                self.reject(name, &err);
                Err(err)
            }
        }
    }

    fn reject(&self, name: &str, err: &GuardError) {
        tracing::debug!(endpoint = %name, reason = err.kind(), "call rejected");
        self.telemetry.record(name, Outcome::Rejected, None);
        self.events.emit(
            name,
            EventKind::CallRejected {
                reason: err.kind().to_string(),
            },
        );
    }

    async fn run<F, Fut, T, E>(
        &self,
        name: &str,
        circuit: &CircuitBreaker,
        timeout: Duration,
        work: F,
    ) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let started = Instant::now();
        // Calling `work` inside the async block keeps a panic in the closure
        // itself within reach of catch_unwind.
        let call = AssertUnwindSafe(async move { work().await }).catch_unwind();
        let result = tokio::time::timeout(timeout, call).await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_millis() as u64;

        match result {
            Ok(Ok(Ok(value))) => {
                let transition = circuit.record_success();
                self.telemetry.record(name, Outcome::Success, Some(elapsed));
                self.events.emit(name, EventKind::CallSuccess { duration_ms });
                self.on_transition(name, transition);
                Ok(value)
            }
            Ok(Ok(Err(e))) => {
                let source: BoxError = e.into();
                self.on_failure(name, circuit, elapsed, source.to_string());
                Err(GuardError::Execution {
                    endpoint: name.to_string(),
                    source,
                })
            }
            Ok(Err(panic)) => {
                let message = format!("protected work panicked: {}", panic_message(&*panic));
                self.on_failure(name, circuit, elapsed, message.clone());
                Err(GuardError::Execution {
                    endpoint: name.to_string(),
                    source: message.into(),
                })
            }
            Err(_) => {
                let transition = circuit.record_failure();
                self.telemetry.record(name, Outcome::Timeout, Some(elapsed));
                self.events.emit(name, EventKind::CallTimeout { duration_ms });
                tracing::debug!(endpoint = %name, timeout_ms = timeout.as_millis() as u64, "call timed out");
                self.on_transition(name, transition);
                Err(GuardError::ExecutionTimeout {
                    endpoint: name.to_string(),
                    ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn on_failure(&self, name: &str, circuit: &CircuitBreaker, elapsed: Duration, error: String) {
        let transition = circuit.record_failure();
        self.telemetry.record(name, Outcome::Failure, Some(elapsed));
        tracing::debug!(endpoint = %name, error = %error, "call failed");
        self.events.emit(
            name,
            EventKind::CallFailure {
                duration_ms: elapsed.as_millis() as u64,
                error,
            },
        );
        self.on_transition(name, transition);
    }

    /// Publishes after the circuit lock is released, so concurrent callers
    /// may emit `state_change` events out of order. Snapshots read status
    /// from the live circuit instead.
    fn on_transition(&self, name: &str, transition: Option<Transition>) {
        let Some(t) = transition else {
            return;
        };
        self.telemetry.set_status(name, t.to);
        self.events.emit(
            name,
            EventKind::StateChange {
                from: t.from,
                to: t.to,
            },
        );
    }

    // ── Circuit ──────────────────────────────────────────────────────────

    /// Circuit snapshot, or `None` if the endpoint has never been called
    /// or configured.
    pub fn get_stats(&self, name: &str) -> Option<CircuitSnapshot> {
        self.circuits.get(name).map(|c| c.snapshot())
    }

    /// Force the endpoint's circuit back to closed.
    pub fn reset_circuit(&self, name: &str) -> Option<Transition> {
        let transition = self.circuits.reset(name)?;
        self.telemetry.set_status(name, transition.to);
        Some(transition)
    }

    // ── Configuration ────────────────────────────────────────────────────

    pub fn get_config(&self, name: &str) -> EndpointConfig {
        self.config.get_config(name)
    }

    pub fn config_snapshot(&self, name: &str) -> ConfigSnapshot {
        self.config.snapshot(name)
    }

    pub fn config_history(&self, name: &str) -> Vec<ConfigHistoryEntry> {
        self.config.history(name)
    }

    /// Validate and merge `changes`; returns the new version.
    pub fn update_config(&self, name: &str, changes: &ConfigChanges) -> Result<u64, GuardError> {
        self.config.update(name, changes)
    }

    pub fn apply_profile(&self, name: &str, profile: &str) -> Result<u64, GuardError> {
        self.config.apply_profile(name, profile)
    }

    pub fn rollback(&self, name: &str) -> Result<u64, GuardError> {
        self.config.rollback(name)
    }

    pub fn reset_config(&self, name: &str) -> Result<u64, GuardError> {
        self.config.reset_to_default(name)
    }

    pub fn register_profile(&self, profile: &str, config: EndpointConfig) -> Result<(), GuardError> {
        self.config.register_profile(profile, config)
    }

    pub fn profiles(&self) -> Vec<String> {
        self.config.profiles()
    }

    // ── Telemetry and health ─────────────────────────────────────────────

    /// Telemetry snapshot. `circuit_status` is taken from the live circuit
    /// when one exists.
    pub fn get_metrics(&self, name: &str) -> TelemetrySnapshot {
        let mut snapshot = self.telemetry.get_metrics(name);
        if let Some(circuit) = self.circuits.get(name) {
            snapshot.circuit_status = Some(circuit.status());
        }
        snapshot
    }

    pub fn bulkhead_stats(&self, name: &str) -> Option<BulkheadSnapshot> {
        self.bulkheads.get(name).map(|b| b.snapshot())
    }

    pub fn health(&self, name: &str) -> EndpointHealth {
        let circuit = self.get_stats(name);
        let telemetry = self.get_metrics(name);
        let bulkhead = self.bulkhead_stats(name);
        health::endpoint_health(name, circuit.as_ref(), &telemetry, bulkhead.as_ref())
    }

    pub fn system_health(&self) -> SystemHealth {
        let records = self.endpoints().iter().map(|name| self.health(name)).collect();
        health::system_health(records)
    }

    /// Every endpoint known to any component, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut names = self.circuits.names();
        names.extend(self.bulkheads.names());
        names.extend(self.telemetry.endpoints());
        names.extend(self.config.endpoints());
        names.sort();
        names.dedup();
        names
    }

    // ── Adaptive thresholds ──────────────────────────────────────────────

    /// Start periodic adaptation. `None` if disabled in settings.
    pub fn start_adaptive(&self) -> Option<AdaptiveHandle> {
        self.adaptive.spawn()
    }

    /// Run one adaptation pass now.
    pub fn adapt_now(&self) -> Vec<(String, AdaptationOutcome)> {
        self.adaptive.run_once()
    }

    pub fn adaptive_metrics(&self, name: &str) -> Option<AdaptiveMetrics> {
        self.adaptive.adaptive_metrics(name)
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard() -> (Guard, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let mut settings = GuardSettings::default();
        settings.defaults.circuit.failure_threshold = 2;
        (Guard::with_sink(settings, sink.clone()).unwrap(), sink)
    }

    async fn ok(v: u32) -> Result<u32, std::io::Error> {
        Ok(v)
    }

    async fn fail() -> Result<u32, std::io::Error> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
    }

    #[tokio::test]
    async fn success_passes_value_through() {
        let (g, sink) = guard();
        let v = g.execute("svc", || ok(7), CallOptions::default()).await.unwrap();
        assert_eq!(v, 7);
        assert_eq!(g.get_metrics("svc").successes, 1);
        assert_eq!(sink.count("svc", "call_success"), 1);
        assert_eq!(sink.count("svc", "circuit_created"), 1);
    }

    #[tokio::test]
    async fn fresh_circuit_reports_closed_status() {
        let (g, _) = guard();
        assert_eq!(g.get_metrics("svc").circuit_status, None);
        g.execute("svc", || ok(1), CallOptions::default()).await.unwrap();
        assert_eq!(g.get_stats("svc").unwrap().status, CircuitStatus::Closed);
        assert_eq!(g.get_metrics("svc").circuit_status, Some(CircuitStatus::Closed));
        assert_eq!(g.health("svc").status, Some(CircuitStatus::Closed));
    }

    #[tokio::test]
    async fn stale_published_status_does_not_leak_into_metrics() {
        let (g, _) = guard();
        g.execute("svc", fail, CallOptions::default()).await.unwrap_err();
        g.execute("svc", fail, CallOptions::default()).await.unwrap_err();
        // A late publish from another caller's earlier transition.
        g.telemetry.set_status("svc", CircuitStatus::HalfOpen);
        assert_eq!(g.get_stats("svc").unwrap().status, CircuitStatus::Open);
        assert_eq!(g.get_metrics("svc").circuit_status, Some(CircuitStatus::Open));
    }

    #[tokio::test]
    async fn error_is_preserved_as_source() {
        let (g, sink) = guard();
        let err = g.execute("svc", fail, CallOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), "execution_error");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "boom");
        assert_eq!(sink.count("svc", "call_failure"), 1);
    }

    #[tokio::test]
    async fn panicking_work_is_a_failure() {
        let (g, _) = guard();
        let err = g
            .execute(
                "svc",
                || async {
                    if true {
                        panic!("kaboom");
                    }
                    Ok::<u32, std::io::Error>(1)
                },
                CallOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert_eq!(g.get_metrics("svc").failures, 1);
        assert_eq!(g.get_stats("svc").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_work_times_out() {
        let (g, sink) = guard();
        let err = g
            .execute(
                "svc",
                || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<u32, std::io::Error>(1)
                },
                CallOptions::default().timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::ExecutionTimeout { ms: 100, .. }));
        let m = g.get_metrics("svc");
        assert_eq!((m.timeouts, m.failures, m.total_calls), (1, 1, 1));
        assert_eq!(sink.count("svc", "call_timeout"), 1);
    }

    #[tokio::test]
    async fn open_circuit_skips_work() {
        let (g, sink) = guard();
        g.execute("svc", fail, CallOptions::default()).await.unwrap_err();
        g.execute("svc", fail, CallOptions::default()).await.unwrap_err();
        assert_eq!(g.get_stats("svc").unwrap().status, CircuitStatus::Open);

        let calls = AtomicUsize::new(0);
        let err = g
            .execute(
                "svc",
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ok(1)
                },
                CallOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let m = g.get_metrics("svc");
        assert_eq!(m.rejections, 1);
        assert_eq!(m.total_calls, 2);
        assert_eq!(m.circuit_status, Some(CircuitStatus::Open));
        assert_eq!(sink.count("svc", "state_change"), 1);
        assert_eq!(sink.count("svc", "call_rejected"), 1);
    }

    #[tokio::test]
    async fn config_updates_reach_live_circuit() {
        let (g, _) = guard();
        g.execute("svc", || ok(1), CallOptions::default()).await.unwrap();
        g.update_config("svc", &ConfigChanges::new().failure_threshold(1)).unwrap();
        assert_eq!(g.get_stats("svc").unwrap().config.failure_threshold, 1);

        g.execute("svc", fail, CallOptions::default()).await.unwrap_err();
        assert_eq!(g.get_stats("svc").unwrap().status, CircuitStatus::Open);

        g.reset_circuit("svc").unwrap();
        assert_eq!(g.get_stats("svc").unwrap().status, CircuitStatus::Closed);
        assert_eq!(g.get_metrics("svc").circuit_status, Some(CircuitStatus::Closed));
    }

    #[tokio::test]
    async fn bulkhead_rejection_is_counted() {
        let (g, _) = guard();
        g.update_config(
            "svc",
            &ConfigChanges::new().bulkhead(
                crate::config::BulkheadChanges::new()
                    .max_concurrent(1)
                    .max_queued(0),
            ),
        )
        .unwrap();

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let g = Arc::new(g);
        let holder = {
            let g = g.clone();
            tokio::spawn(async move {
                g.execute_with_bulkhead(
                    "svc",
                    || async move {
                        let _ = release_rx.await;
                        Ok::<u32, std::io::Error>(1)
                    },
                    CallOptions::default(),
                )
                .await
            })
        };
        while g.bulkhead_stats("svc").unwrap().active == 0 {
            tokio::task::yield_now().await;
        }

        let err = g
            .execute_with_bulkhead("svc", || ok(2), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::BulkheadFull { .. }));
        assert_eq!(g.get_metrics("svc").rejections, 1);

        release_tx.send(()).unwrap();
        assert_eq!(holder.await.unwrap().unwrap(), 1);
        assert_eq!(g.bulkhead_stats("svc").unwrap().active, 0);
    }

    #[test]
    fn settings_overrides_are_applied() {
        let json = r#"{
            "endpoints": {
                "openai": { "profile": "conservative", "changes": { "failure_threshold": 4 } }
            },
            "custom_profiles": { "tiny": { "failure_threshold": 1 } }
        }"#;
        let settings = GuardSettings::from_json_str(json).unwrap();
        let g = Guard::with_sink(settings, Arc::new(crate::events::NoopSink)).unwrap();

        let snap = g.config_snapshot("openai");
        assert_eq!(snap.version, 3);
        assert_eq!(snap.config.circuit.failure_threshold, 4);
        assert_eq!(snap.config.circuit.success_threshold, 3);
        assert!(g.profiles().contains(&"tiny".to_string()));
    }

    #[test]
    fn empty_guard_is_healthy() {
        let (g, _) = guard();
        let sys = g.system_health();
        assert_eq!(sys.score, 100);
        assert!(sys.endpoints.is_empty());
    }
}
