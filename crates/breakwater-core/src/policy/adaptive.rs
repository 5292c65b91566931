//! Adaptive failure thresholds driven by observed error rates.
//!
//! Every `update_interval` the controller walks the endpoints telemetry
//! knows about and retunes `failure_threshold`:
//!
//! | error rate    | new threshold                               |
//! |---------------|---------------------------------------------|
//! | > 0.30        | `round(current * (1 - factor))`             |
//! | 0.10 ..= 0.30 | unchanged                                   |
//! | 0.02 .. 0.10  | `round(current * (1 + factor))`             |
//! | < 0.02        | `round(current * (1 + 2 * factor))`         |
//!
//! The result is always clamped to `[min_threshold, max_threshold]`.
//! Endpoints with fewer than `min_calls_for_adaptation` executed calls are
//! skipped.
//!
//! Writes go through [`ConfigManager::update`]; a manual update racing with
//! the controller is resolved by whichever commits last.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{duration_ms, ConfigChanges, ConfigManager};
use crate::error::GuardError;
use crate::events::{EventBus, EventKind};
use crate::lock::lock;
use crate::telemetry::Telemetry;

/// Number of adaptation events kept per endpoint.
pub const ADAPTATION_HISTORY: usize = 10;

/// Controller tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    #[serde(rename = "update_interval_ms", with = "duration_ms")]
    pub update_interval: Duration,
    pub min_calls_for_adaptation: u64,
    pub adaptation_factor: f64,
    pub min_threshold: u32,
    pub max_threshold: u32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            update_interval: Duration::from_secs(60),
            min_calls_for_adaptation: 10,
            adaptation_factor: 0.1,
            min_threshold: 2,
            max_threshold: 20,
        }
    }
}

/// Compute the next failure threshold for `current` at `error_rate`.
pub fn compute_threshold(current: u32, error_rate: f64, config: &AdaptiveConfig) -> u32 {
    let factor = config.adaptation_factor;
    let scaled = |multiplier: f64| (f64::from(current) * multiplier).round();

    let raw = if error_rate > 0.30 {
        scaled(1.0 - factor)
    } else if error_rate >= 0.10 {
        f64::from(current)
    } else if error_rate >= 0.02 {
        scaled(1.0 + factor)
    } else {
        scaled(1.0 + 2.0 * factor)
    };

    let lo = f64::from(config.min_threshold);
    let hi = f64::from(config.max_threshold.max(config.min_threshold));
    raw.clamp(lo, hi) as u32
}

/// One applied threshold change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptationEvent {
    pub old_threshold: u32,
    pub new_threshold: u32,
    pub error_rate: f64,
    pub total_calls: u64,
    pub timestamp: DateTime<Utc>,
}

/// Per-endpoint controller state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptiveMetrics {
    pub current_threshold: u32,
    /// Time of the last applied change.
    pub last_updated: Option<DateTime<Utc>>,
    /// Most recent changes, oldest first.
    pub history: Vec<AdaptationEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InsufficientCalls { calls: u64, required: u64 },
}

/// What one evaluation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdaptationOutcome {
    Adjusted { old: u32, new: u32, version: u64 },
    Unchanged { threshold: u32 },
    Skipped(SkipReason),
}

#[derive(Default)]
struct MetricsRecord {
    current_threshold: u32,
    last_updated: Option<DateTime<Utc>>,
    history: VecDeque<AdaptationEvent>,
}

/// Periodic threshold tuner.
pub struct AdaptiveController {
    config: AdaptiveConfig,
    manager: Arc<ConfigManager>,
    telemetry: Arc<Telemetry>,
    events: EventBus,
    metrics: Mutex<HashMap<String, MetricsRecord>>,
}

impl AdaptiveController {
    pub fn new(
        config: AdaptiveConfig,
        manager: Arc<ConfigManager>,
        telemetry: Arc<Telemetry>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            manager,
            telemetry,
            events,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// Evaluate one endpoint and apply a new threshold if it changed.
    pub fn evaluate(&self, endpoint: &str) -> Result<AdaptationOutcome, GuardError> {
        let stats = self.telemetry.get_metrics(endpoint);
        if stats.total_calls < self.config.min_calls_for_adaptation {
            return Ok(AdaptationOutcome::Skipped(SkipReason::InsufficientCalls {
                calls: stats.total_calls,
                required: self.config.min_calls_for_adaptation,
            }));
        }

        let current = self.manager.get_config(endpoint).circuit.failure_threshold;
        let new = compute_threshold(current, stats.failure_rate, &self.config);
        if new == current {
            lock(&self.metrics)
                .entry(endpoint.to_string())
                .or_default()
                .current_threshold = current;
            return Ok(AdaptationOutcome::Unchanged { threshold: current });
        }

        let version = self.manager.update(
            endpoint,
            &ConfigChanges::new().failure_threshold(i64::from(new)),
        )?;

        let now = Utc::now();
        {
            let mut metrics = lock(&self.metrics);
            let rec = metrics.entry(endpoint.to_string()).or_default();
            rec.current_threshold = new;
            rec.last_updated = Some(now);
            rec.history.push_back(AdaptationEvent {
                old_threshold: current,
                new_threshold: new,
                error_rate: stats.failure_rate,
                total_calls: stats.total_calls,
                timestamp: now,
            });
            while rec.history.len() > ADAPTATION_HISTORY {
                rec.history.pop_front();
            }
        }

        tracing::info!(
            endpoint,
            old = current,
            new,
            error_rate = stats.failure_rate,
            "failure threshold adapted"
        );
        self.events.emit(
            endpoint,
            EventKind::ThresholdUpdate {
                old: current,
                new,
                error_rate: stats.failure_rate,
            },
        );
        Ok(AdaptationOutcome::Adjusted {
            old: current,
            new,
            version,
        })
    }

    /// Evaluate every endpoint with telemetry. Failures are logged and
    /// left out of the result.
    pub fn run_once(&self) -> Vec<(String, AdaptationOutcome)> {
        let mut outcomes = Vec::new();
        for endpoint in self.telemetry.endpoints() {
            match self.evaluate(&endpoint) {
                Ok(outcome) => outcomes.push((endpoint, outcome)),
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "threshold adaptation failed");
                }
            }
        }
        outcomes
    }

    /// Controller state for `endpoint`, if it has been evaluated.
    pub fn adaptive_metrics(&self, endpoint: &str) -> Option<AdaptiveMetrics> {
        lock(&self.metrics).get(endpoint).map(|rec| AdaptiveMetrics {
            current_threshold: rec.current_threshold,
            last_updated: rec.last_updated,
            history: rec.history.iter().cloned().collect(),
        })
    }

    /// Start the periodic task. Returns `None` when adaptation is disabled.
    ///
    /// The first evaluation happens one full interval after spawning.
    pub fn spawn(self: &Arc<Self>) -> Option<AdaptiveHandle> {
        if !self.config.enabled {
            tracing::debug!("adaptive thresholds disabled");
            return None;
        }
        let period = self.config.update_interval.max(Duration::from_millis(1));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let controller = self.clone();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(interval_ms = period.as_millis() as u64, "adaptive controller started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcomes = controller.run_once();
                        tracing::debug!(endpoints = outcomes.len(), "adaptation pass complete");
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("adaptive controller stopped");
        });

        Some(AdaptiveHandle { shutdown_tx, task })
    }
}

impl std::fmt::Debug for AdaptiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveController")
            .field("config", &self.config)
            .finish()
    }
}

/// Handle to a running adaptive task.
#[derive(Debug)]
pub struct AdaptiveHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AdaptiveHandle {
    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "adaptive task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
