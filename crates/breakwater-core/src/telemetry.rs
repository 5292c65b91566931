//! Per-endpoint call telemetry.
//!
//! Counters are cumulative for the life of the process; there is no time
//! window. `failure_rate` therefore reflects every call ever made, which can
//! make the adaptive controller slow to react after a long healthy stretch
//! follows a bad one.
//!
//! Accounting:
//! - `total_calls` counts executed calls (success + failure + timeout)
//! - a timeout counts as both a `timeout` and a `failure`
//! - rejections (circuit open, bulkhead) only count in `rejections`

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::lock::{lock, read, write};
use crate::policy::CircuitStatus;

/// Default number of recent durations kept per endpoint.
pub const DEFAULT_SAMPLE_SIZE: usize = 100;

/// Result of one guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Timeout,
    Rejected,
}

/// Point-in-time view of an endpoint's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    pub endpoint: String,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Most recent call durations, oldest first.
    pub recent_durations_ms: Vec<u64>,
    pub avg_duration_ms: Option<f64>,
    /// Last circuit status seen by telemetry (reporting only).
    pub circuit_status: Option<CircuitStatus>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct TelemetryRecord {
    total_calls: u64,
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejections: u64,
    durations: VecDeque<Duration>,
    circuit_status: Option<CircuitStatus>,
    last_event_at: Option<DateTime<Utc>>,
}

/// Keyed store of telemetry records.
pub struct Telemetry {
    records: RwLock<HashMap<String, Arc<Mutex<TelemetryRecord>>>>,
    sample_size: usize,
}

impl Telemetry {
    pub fn new(sample_size: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            sample_size: sample_size.max(1),
        }
    }

    /// Record one outcome. Never blocks beyond a short per-endpoint lock.
    pub fn record(&self, endpoint: &str, outcome: Outcome, duration: Option<Duration>) {
        let record = self.record_for(endpoint);
        let mut rec = lock(&record);
        match outcome {
            Outcome::Success => {
                rec.total_calls += 1;
                rec.successes += 1;
            }
            Outcome::Failure => {
                rec.total_calls += 1;
                rec.failures += 1;
            }
            Outcome::Timeout => {
                rec.total_calls += 1;
                rec.failures += 1;
                rec.timeouts += 1;
            }
            Outcome::Rejected => rec.rejections += 1,
        }
        if let Some(d) = duration {
            if rec.durations.len() == self.sample_size {
                rec.durations.pop_front();
            }
            rec.durations.push_back(d);
        }
        rec.last_event_at = Some(Utc::now());
    }

    /// Remember the circuit's latest status for reporting.
    pub fn set_status(&self, endpoint: &str, status: CircuitStatus) {
        lock(&self.record_for(endpoint)).circuit_status = Some(status);
    }

    /// Snapshot with rates computed now. Unknown endpoints read as all zeros.
    pub fn get_metrics(&self, endpoint: &str) -> TelemetrySnapshot {
        let Some(record) = read(&self.records).get(endpoint).cloned() else {
            return empty_snapshot(endpoint);
        };
        let rec = lock(&record);

        let (success_rate, failure_rate) = if rec.total_calls == 0 {
            (0.0, 0.0)
        } else {
            let total = rec.total_calls as f64;
            (rec.successes as f64 / total, rec.failures as f64 / total)
        };
        let avg_duration_ms = if rec.durations.is_empty() {
            None
        } else {
            let sum: Duration = rec.durations.iter().sum();
            Some(sum.as_secs_f64() * 1000.0 / rec.durations.len() as f64)
        };

        TelemetrySnapshot {
            endpoint: endpoint.to_string(),
            total_calls: rec.total_calls,
            successes: rec.successes,
            failures: rec.failures,
            timeouts: rec.timeouts,
            rejections: rec.rejections,
            success_rate,
            failure_rate,
            recent_durations_ms: rec
                .durations
                .iter()
                .map(|d| d.as_millis() as u64)
                .collect(),
            avg_duration_ms,
            circuit_status: rec.circuit_status,
            last_event_at: rec.last_event_at,
        }
    }

    /// Endpoints with at least one recorded event, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.records).keys().cloned().collect();
        names.sort();
        names
    }

    fn record_for(&self, endpoint: &str) -> Arc<Mutex<TelemetryRecord>> {
        if let Some(rec) = read(&self.records).get(endpoint) {
            return rec.clone();
        }
        write(&self.records)
            .entry(endpoint.to_string())
            .or_default()
            .clone()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE)
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("endpoints", &self.endpoints())
            .field("sample_size", &self.sample_size)
            .finish()
    }
}

fn empty_snapshot(endpoint: &str) -> TelemetrySnapshot {
    TelemetrySnapshot {
        endpoint: endpoint.to_string(),
        total_calls: 0,
        successes: 0,
        failures: 0,
        timeouts: 0,
        rejections: 0,
        success_rate: 0.0,
        failure_rate: 0.0,
        recent_durations_ms: Vec::new(),
        avg_duration_ms: None,
        circuit_status: None,
        last_event_at: None,
    }
}
