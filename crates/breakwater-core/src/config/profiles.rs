//! Built-in configuration presets.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{BulkheadConfig, CircuitConfig, EndpointConfig};

/// Names of the built-in profiles, in display order.
pub const BUILTIN_PROFILES: [&str; 5] = [
    "conservative",
    "aggressive",
    "balanced",
    "high_throughput",
    "experimental",
];

const fn preset(
    failure_threshold: u32,
    success_threshold: u32,
    reset_timeout_ms: u64,
    timeout_ms: u64,
    max_concurrent: usize,
    max_queued: usize,
    queue_timeout_ms: u64,
) -> EndpointConfig {
    EndpointConfig {
        circuit: CircuitConfig {
            failure_threshold,
            success_threshold,
            reset_timeout: Duration::from_millis(reset_timeout_ms),
            call_timeout: Duration::from_millis(timeout_ms),
        },
        bulkhead: BulkheadConfig {
            max_concurrent,
            max_queued,
            queue_timeout: Duration::from_millis(queue_timeout_ms),
        },
    }
}

/// Look up a built-in profile by name.
pub fn builtin(name: &str) -> Option<EndpointConfig> {
    let cfg = match name {
        // Trips early, recovers slowly, small bulkhead.
        "conservative" => preset(3, 3, 60_000, 30_000, 5, 10, 10_000),
        // Tolerates many failures, probes again quickly.
        "aggressive" => preset(10, 1, 10_000, 15_000, 20, 100, 2_000),
        "balanced" => preset(5, 2, 30_000, 30_000, 10, 50, 5_000),
        "high_throughput" => preset(15, 2, 15_000, 10_000, 50, 200, 1_000),
        "experimental" => preset(2, 5, 120_000, 60_000, 2, 5, 30_000),
        _ => return None,
    };
    Some(cfg)
}

/// Returns `true` if `name` is reserved by a built-in profile.
pub fn is_builtin(name: &str) -> bool {
    BUILTIN_PROFILES.contains(&name)
}

/// Which profile produced an endpoint's current config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum ProfileTag {
    /// Hard-coded defaults (initial state and after a reset).
    Default,
    /// A built-in or registered profile, by name.
    Named(String),
    /// Hand-edited via an update.
    Custom,
}

impl fmt::Display for ProfileTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Named(name) => write!(f, "{name}"),
            Self::Custom => write!(f, "custom"),
        }
    }
}
