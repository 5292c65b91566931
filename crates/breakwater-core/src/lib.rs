//! breakwater-core — adaptive fault tolerance for calls to unreliable
//! remote services.
//!
//! # Overview
//!
//! - [`Guard`] — facade composing every component below
//! - [`policy`] module — circuit breaker, bulkhead, adaptive thresholds
//! - [`config`] module — versioned per-endpoint config with profiles and rollback
//! - [`telemetry`] module — cumulative per-endpoint call counters
//! - [`health`] module — derived health scores
//! - [`events`] module — event surface and sinks
//! - [`GuardError`] — the error taxonomy callers see
//!
//! All state is process-local and keyed by endpoint name. Each endpoint's
//! circuit, bulkhead and config record have their own lock, so unrelated
//! endpoints never contend.

pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod health;
mod lock;
pub mod policy;
pub mod telemetry;

pub use config::{
    BulkheadChanges, BulkheadConfig, CircuitConfig, ConfigChanges, EndpointConfig, GuardSettings,
    SettingsError,
};
pub use error::{BoxError, GuardError, InvalidField};
pub use events::{EventKind, EventSink, GuardEvent};
pub use guard::{CallOptions, Guard};
pub use health::{EndpointHealth, HealthLevel, SystemHealth};
pub use policy::{CircuitStatus, AdaptiveConfig};
pub use telemetry::{Outcome, TelemetrySnapshot};
