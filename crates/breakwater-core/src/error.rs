//! Guard-level error types.

use std::fmt;

use thiserror::Error;

/// Boxed error produced by protected work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A single rejected field in a config update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidField {
    FailureThreshold,
    SuccessThreshold,
    ResetTimeout,
    Timeout,
    MaxConcurrent,
    MaxQueued,
    QueueTimeout,
}

impl InvalidField {
    /// Stable snake_case identifier, e.g. `invalid_failure_threshold`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailureThreshold => "invalid_failure_threshold",
            Self::SuccessThreshold => "invalid_success_threshold",
            Self::ResetTimeout => "invalid_reset_timeout",
            Self::Timeout => "invalid_timeout",
            Self::MaxConcurrent => "invalid_max_concurrent",
            Self::MaxQueued => "invalid_max_queued",
            Self::QueueTimeout => "invalid_queue_timeout",
        }
    }
}

impl fmt::Display for InvalidField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to callers of the guard.
///
/// Every path through `execute` either returns the work's value or exactly
/// one of these variants; the underlying cause is preserved where one exists.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Circuit is open — the work was not attempted.
    #[error("circuit open for endpoint: {endpoint}")]
    CircuitOpen { endpoint: String },

    /// Bulkhead has no free slot and no queue.
    #[error("bulkhead full for endpoint: {endpoint}")]
    BulkheadFull { endpoint: String },

    /// Bulkhead slots and wait queue are both exhausted.
    #[error("bulkhead queue full for endpoint: {endpoint}")]
    BulkheadQueueFull { endpoint: String },

    /// Request was queued but no slot freed up in time.
    #[error("bulkhead queue wait for {endpoint} timed out after {ms}ms")]
    BulkheadTimeout { endpoint: String, ms: u64 },

    /// Protected work did not finish within its call timeout.
    #[error("call to {endpoint} timed out after {ms}ms")]
    ExecutionTimeout { endpoint: String, ms: u64 },

    /// Protected work returned an error or panicked.
    #[error("call to {endpoint} failed: {source}")]
    Execution {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    /// Config update rejected; every offending field is listed.
    #[error("invalid config: {}", join_fields(.0))]
    InvalidConfig(Vec<InvalidField>),

    /// Rollback requested but no earlier version exists.
    #[error("no config history for endpoint: {endpoint}")]
    NoHistory { endpoint: String },

    /// Neither a built-in nor a registered custom profile has this name.
    #[error("unknown profile: {0}")]
    UnknownProfile(String),

    /// Custom profiles may not reuse a built-in profile's name.
    #[error("profile name is reserved by a built-in profile: {0}")]
    ReservedProfile(String),
}

fn join_fields(fields: &[InvalidField]) -> String {
    fields
        .iter()
        .map(InvalidField::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl GuardError {
    /// Returns `true` if the call was refused before any work ran.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::BulkheadFull { .. } | Self::BulkheadQueueFull { .. }
        )
    }

    /// Returns `true` for either flavour of timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::BulkheadTimeout { .. } | Self::ExecutionTimeout { .. }
        )
    }

    /// Short machine-readable tag for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::BulkheadFull { .. } => "bulkhead_full",
            Self::BulkheadQueueFull { .. } => "bulkhead_queue_full",
            Self::BulkheadTimeout { .. } => "bulkhead_timeout",
            Self::ExecutionTimeout { .. } => "execution_timeout",
            Self::Execution { .. } => "execution_error",
            Self::InvalidConfig(_) => "invalid_config",
            Self::NoHistory { .. } => "no_history",
            Self::UnknownProfile(_) => "unknown_profile",
            Self::ReservedProfile(_) => "reserved_profile",
        }
    }

    /// The invalid fields, if this is a validation failure.
    pub fn invalid_fields(&self) -> Option<&[InvalidField]> {
        match self {
            Self::InvalidConfig(fields) => Some(fields),
            _ => None,
        }
    }
}
