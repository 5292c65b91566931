//! # breakwater-observability
//!
//! Logging setup and OpenTelemetry metrics for Breakwater.
//!
//! ## Built-in metrics
//! - `breakwater.calls`              — counter, tagged with endpoint + outcome
//! - `breakwater.rejections`         — counter, tagged with endpoint + reason
//! - `breakwater.state_changes`      — counter, tagged with endpoint + from + to
//! - `breakwater.threshold_updates`  — counter, tagged with endpoint + direction
//! - `breakwater.config_changes`     — counter, tagged with endpoint + change
//! - `breakwater.call_duration_ms`   — histogram, tagged with endpoint + outcome
//! - `breakwater.bulkhead_queue_depth` — histogram, tagged with endpoint
//!
//! [`GuardMetrics`] is an [`EventSink`](breakwater_core::EventSink); hand it
//! to `Guard::with_sink` (alone or inside a `FanoutSink`). Exporter wiring
//! is left to the application.
//!
//! ## Structured logging
//! Human-readable or JSON lines, with per-component level overrides.

pub mod metrics;
pub mod tracing_setup;

pub use metrics::GuardMetrics;
pub use tracing_setup::{init_tracing, LogConfig};
