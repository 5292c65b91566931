//! Per-endpoint tunables, partial updates, and validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::InvalidField;

/// Circuit breaker parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures (while closed) before opening.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing.
    pub success_threshold: u32,
    /// How long to stay open before admitting a trial call.
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,
    /// Default per-call timeout for protected work.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Bulkhead (concurrency limiter) parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Maximum permits held at once.
    pub max_concurrent: usize,
    /// Maximum requests waiting for a permit. `0` disables queueing.
    pub max_queued: usize,
    /// Longest a queued request waits before giving up.
    #[serde(rename = "queue_timeout_ms", with = "duration_ms")]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queued: 50,
            queue_timeout: Duration::from_secs(5),
        }
    }
}

/// Effective configuration for one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    #[serde(flatten)]
    pub circuit: CircuitConfig,
    pub bulkhead: BulkheadConfig,
}

impl EndpointConfig {
    /// Check a complete config against the same rules as [`ConfigChanges`].
    pub fn validate(&self) -> Result<(), Vec<InvalidField>> {
        let mut invalid = Vec::new();
        if self.circuit.failure_threshold == 0 {
            invalid.push(InvalidField::FailureThreshold);
        }
        if self.circuit.success_threshold == 0 {
            invalid.push(InvalidField::SuccessThreshold);
        }
        if self.circuit.call_timeout.is_zero() {
            invalid.push(InvalidField::Timeout);
        }
        if self.bulkhead.max_concurrent == 0 {
            invalid.push(InvalidField::MaxConcurrent);
        }
        if self.bulkhead.queue_timeout.is_zero() {
            invalid.push(InvalidField::QueueTimeout);
        }
        if invalid.is_empty() {
            Ok(())
        } else {
            Err(invalid)
        }
    }
}

/// Partial update to an [`EndpointConfig`].
///
/// Fields are signed so that out-of-range input (e.g. from JSON) reaches
/// validation and is reported rather than failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadChanges>,
}

/// Partial update to a [`BulkheadConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_queued: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_timeout_ms: Option<i64>,
}

impl ConfigChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, value: i64) -> Self {
        self.failure_threshold = Some(value);
        self
    }

    pub fn success_threshold(mut self, value: i64) -> Self {
        self.success_threshold = Some(value);
        self
    }

    pub fn reset_timeout_ms(mut self, value: i64) -> Self {
        self.reset_timeout_ms = Some(value);
        self
    }

    pub fn timeout_ms(mut self, value: i64) -> Self {
        self.timeout_ms = Some(value);
        self
    }

    pub fn bulkhead(mut self, changes: BulkheadChanges) -> Self {
        self.bulkhead = Some(changes);
        self
    }

    /// Returns `true` if no field would change.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Every field that fails validation, in declaration order.
    pub fn validate(&self) -> Vec<InvalidField> {
        let mut invalid = Vec::new();
        if self.failure_threshold.is_some_and(|v| !positive_u32(v)) {
            invalid.push(InvalidField::FailureThreshold);
        }
        if self.success_threshold.is_some_and(|v| !positive_u32(v)) {
            invalid.push(InvalidField::SuccessThreshold);
        }
        if self.reset_timeout_ms.is_some_and(|v| v < 0) {
            invalid.push(InvalidField::ResetTimeout);
        }
        if self.timeout_ms.is_some_and(|v| v <= 0) {
            invalid.push(InvalidField::Timeout);
        }
        if let Some(bulkhead) = &self.bulkhead {
            if bulkhead.max_concurrent.is_some_and(|v| v <= 0) {
                invalid.push(InvalidField::MaxConcurrent);
            }
            if bulkhead.max_queued.is_some_and(|v| v < 0) {
                invalid.push(InvalidField::MaxQueued);
            }
            if bulkhead.queue_timeout_ms.is_some_and(|v| v <= 0) {
                invalid.push(InvalidField::QueueTimeout);
            }
        }
        invalid
    }

    /// Merge onto `base`, or return every invalid field without merging.
    pub fn apply_to(&self, base: &EndpointConfig) -> Result<EndpointConfig, Vec<InvalidField>> {
        let invalid = self.validate();
        if !invalid.is_empty() {
            return Err(invalid);
        }

        // validate() guarantees every value below is in range.
        let mut merged = *base;
        if let Some(v) = self.failure_threshold {
            merged.circuit.failure_threshold = v as u32;
        }
        if let Some(v) = self.success_threshold {
            merged.circuit.success_threshold = v as u32;
        }
        if let Some(v) = self.reset_timeout_ms {
            merged.circuit.reset_timeout = Duration::from_millis(v as u64);
        }
        if let Some(v) = self.timeout_ms {
            merged.circuit.call_timeout = Duration::from_millis(v as u64);
        }
        if let Some(bulkhead) = &self.bulkhead {
            if let Some(v) = bulkhead.max_concurrent {
                merged.bulkhead.max_concurrent = v as usize;
            }
            if let Some(v) = bulkhead.max_queued {
                merged.bulkhead.max_queued = v as usize;
            }
            if let Some(v) = bulkhead.queue_timeout_ms {
                merged.bulkhead.queue_timeout = Duration::from_millis(v as u64);
            }
        }
        Ok(merged)
    }
}

impl BulkheadChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrent(mut self, value: i64) -> Self {
        self.max_concurrent = Some(value);
        self
    }

    pub fn max_queued(mut self, value: i64) -> Self {
        self.max_queued = Some(value);
        self
    }

    pub fn queue_timeout_ms(mut self, value: i64) -> Self {
        self.queue_timeout_ms = Some(value);
        self
    }
}

fn positive_u32(v: i64) -> bool {
    v > 0 && v <= i64::from(u32::MAX)
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_untouched_fields() {
        let base = EndpointConfig::default();
        let merged = ConfigChanges::new()
            .failure_threshold(3)
            .bulkhead(BulkheadChanges::new().max_queued(0))
            .apply_to(&base)
            .unwrap();

        assert_eq!(merged.circuit.failure_threshold, 3);
        assert_eq!(merged.circuit.success_threshold, base.circuit.success_threshold);
        assert_eq!(merged.bulkhead.max_queued, 0);
        assert_eq!(merged.bulkhead.max_concurrent, base.bulkhead.max_concurrent);
    }

    #[test]
    fn reports_all_invalid_fields_at_once() {
        let changes = ConfigChanges::new()
            .failure_threshold(0)
            .success_threshold(-2)
            .reset_timeout_ms(-1)
            .timeout_ms(0)
            .bulkhead(
                BulkheadChanges::new()
                    .max_concurrent(0)
                    .max_queued(-1)
                    .queue_timeout_ms(0),
            );
        assert_eq!(
            changes.validate(),
            vec![
                InvalidField::FailureThreshold,
                InvalidField::SuccessThreshold,
                InvalidField::ResetTimeout,
                InvalidField::Timeout,
                InvalidField::MaxConcurrent,
                InvalidField::MaxQueued,
                InvalidField::QueueTimeout,
            ]
        );
    }

    #[test]
    fn zero_reset_timeout_and_queue_are_allowed() {
        let changes = ConfigChanges::new()
            .reset_timeout_ms(0)
            .bulkhead(BulkheadChanges::new().max_queued(0));
        assert!(changes.validate().is_empty());
    }

    #[test]
    fn json_uses_millisecond_fields() {
        let cfg = EndpointConfig::default();
        let json = serde_json::to_value(cfg).unwrap();
        assert_eq!(json["failure_threshold"], 5);
        assert_eq!(json["reset_timeout_ms"], 30_000);
        assert_eq!(json["timeout_ms"], 30_000);
        assert_eq!(json["bulkhead"]["queue_timeout_ms"], 5_000);

        let back: EndpointConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn changes_reject_unknown_fields() {
        let parsed: Result<ConfigChanges, _> =
            serde_json::from_str(r#"{"failure_treshold": 3}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn validate_full_config() {
        let mut cfg = EndpointConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.circuit.failure_threshold = 0;
        cfg.bulkhead.max_concurrent = 0;
        assert_eq!(
            cfg.validate(),
            Err(vec![InvalidField::FailureThreshold, InvalidField::MaxConcurrent])
        );
    }
}
