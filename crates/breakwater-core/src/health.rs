//! Health scoring derived from circuit, telemetry and bulkhead snapshots.
//!
//! Read-only; nothing here is on the request path.
//!
//! Endpoint score = state × 0.5 + failure rate × 0.3 + recovery × 0.1
//! + utilization × 0.1, rounded. The system score is the mean endpoint
//! score minus `min(10 × critical, 50)`.

use std::fmt;

use serde::Serialize;

use crate::policy::{BulkheadSnapshot, CircuitSnapshot, CircuitStatus};
use crate::telemetry::TelemetrySnapshot;

// Weights in percent.
const STATE_WEIGHT: u32 = 50;
const FAILURE_RATE_WEIGHT: u32 = 30;
const RECOVERY_WEIGHT: u32 = 10;
const UTILIZATION_WEIGHT: u32 = 10;

const PENALTY_PER_CRITICAL: u32 = 10;
const MAX_PENALTY: u32 = 50;

/// Coarse health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl HealthLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => Self::Excellent,
            70..=89 => Self::Good,
            50..=69 => Self::Fair,
            30..=49 => Self::Poor,
            _ => Self::Critical,
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Excellent => write!(f, "excellent"),
            Self::Good => write!(f, "good"),
            Self::Fair => write!(f, "fair"),
            Self::Poor => write!(f, "poor"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// The four weighted inputs, each 0–100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComponentScores {
    pub state: u32,
    pub failure_rate: u32,
    pub recovery: u32,
    pub utilization: u32,
}

impl ComponentScores {
    /// Weighted sum, rounded half up.
    pub fn weighted(&self) -> u32 {
        let total = self.state * STATE_WEIGHT
            + self.failure_rate * FAILURE_RATE_WEIGHT
            + self.recovery * RECOVERY_WEIGHT
            + self.utilization * UTILIZATION_WEIGHT;
        (total + 50) / 100
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointHealth {
    pub endpoint: String,
    pub score: u32,
    pub level: HealthLevel,
    pub components: ComponentScores,
    /// `None` if no circuit has been created for the endpoint yet.
    pub status: Option<CircuitStatus>,
    pub failure_rate: f64,
    pub utilization: Option<f64>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
    pub poor: usize,
    pub critical: usize,
}

impl LevelCounts {
    fn add(&mut self, level: HealthLevel) {
        match level {
            HealthLevel::Excellent => self.excellent += 1,
            HealthLevel::Good => self.good += 1,
            HealthLevel::Fair => self.fair += 1,
            HealthLevel::Poor => self.poor += 1,
            HealthLevel::Critical => self.critical += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemHealth {
    pub score: u32,
    pub level: HealthLevel,
    pub counts: LevelCounts,
    pub critical_penalty: u32,
    pub endpoints: Vec<EndpointHealth>,
}

/// closed → 100, half-open → 50, open → 0. No circuit yet reads as closed.
pub fn state_score(status: Option<CircuitStatus>) -> u32 {
    match status {
        None | Some(CircuitStatus::Closed) => 100,
        Some(CircuitStatus::HalfOpen) => 50,
        Some(CircuitStatus::Open) => 0,
    }
}

pub fn failure_rate_score(rate: f64) -> u32 {
    match rate {
        r if r <= 0.01 => 100,
        r if r <= 0.05 => 80,
        r if r <= 0.10 => 60,
        r if r <= 0.25 => 40,
        r if r <= 0.50 => 20,
        _ => 0,
    }
}

/// Scored on time since the last failure; no failure on record → 100.
pub fn recovery_score(since_last_failure_ms: Option<u64>) -> u32 {
    match since_last_failure_ms {
        None => 100,
        Some(ms) if ms >= 300_000 => 100,
        Some(ms) if ms >= 60_000 => 75,
        Some(ms) if ms >= 30_000 => 50,
        Some(ms) if ms >= 10_000 => 25,
        Some(_) => 0,
    }
}

/// Active permits over capacity; no bulkhead → 100.
pub fn utilization_score(utilization: Option<f64>) -> u32 {
    match utilization {
        None => 100,
        Some(u) if u <= 0.50 => 100,
        Some(u) if u <= 0.70 => 80,
        Some(u) if u <= 0.85 => 60,
        Some(u) if u <= 0.95 => 30,
        Some(_) => 0,
    }
}

/// Score one endpoint from whatever snapshots exist for it.
pub fn endpoint_health(
    endpoint: &str,
    circuit: Option<&CircuitSnapshot>,
    telemetry: &TelemetrySnapshot,
    bulkhead: Option<&BulkheadSnapshot>,
) -> EndpointHealth {
    let status = circuit.map(|c| c.status);
    let utilization = bulkhead.map(|b| b.utilization);
    let components = ComponentScores {
        state: state_score(status),
        failure_rate: failure_rate_score(telemetry.failure_rate),
        recovery: recovery_score(circuit.and_then(|c| c.since_last_failure_ms)),
        utilization: utilization_score(utilization),
    };
    let score = components.weighted();

    let mut issues = Vec::new();
    match status {
        Some(CircuitStatus::Open) => issues.push("circuit open".to_string()),
        Some(CircuitStatus::HalfOpen) => issues.push("circuit half-open, recovering".to_string()),
        _ => {}
    }
    if telemetry.failure_rate > 0.10 {
        issues.push(format!(
            "elevated failure rate: {:.1}%",
            telemetry.failure_rate * 100.0
        ));
    }
    if let Some(b) = bulkhead {
        if b.utilization > 0.85 {
            issues.push(format!("bulkhead saturated: {:.0}% in use", b.utilization * 100.0));
        }
        if b.queued > 0 {
            issues.push(format!("{} requests queued", b.queued));
        }
    }

    EndpointHealth {
        endpoint: endpoint.to_string(),
        score,
        level: HealthLevel::from_score(score),
        components,
        status,
        failure_rate: telemetry.failure_rate,
        utilization,
        issues,
    }
}

/// Combine endpoint records. An empty system is excellent at 100.
pub fn system_health(endpoints: Vec<EndpointHealth>) -> SystemHealth {
    let mut counts = LevelCounts::default();
    for e in &endpoints {
        counts.add(e.level);
    }
    if endpoints.is_empty() {
        return SystemHealth {
            score: 100,
            level: HealthLevel::Excellent,
            counts,
            critical_penalty: 0,
            endpoints,
        };
    }

    let mean = endpoints.iter().map(|e| f64::from(e.score)).sum::<f64>() / endpoints.len() as f64;
    let critical_penalty = (PENALTY_PER_CRITICAL * counts.critical as u32).min(MAX_PENALTY);
    let score = (mean - f64::from(critical_penalty)).round().max(0.0) as u32;

    SystemHealth {
        score,
        level: HealthLevel::from_score(score),
        counts,
        critical_penalty,
        endpoints,
    }
}
