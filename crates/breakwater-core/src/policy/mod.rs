//! Policy engine — failure containment for guarded calls.
//!
//! The policy stack (applied in order):
//! ```text
//! Request → [CircuitBreaker] → [Bulkhead] → work
//!                 ↑
//!        [AdaptiveController] retunes failure thresholds
//! ```

pub mod adaptive;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod registry;

pub use adaptive::{
    compute_threshold, AdaptationEvent, AdaptationOutcome, AdaptiveConfig, AdaptiveController,
    AdaptiveHandle, AdaptiveMetrics, SkipReason,
};
pub use bulkhead::{Bulkhead, BulkheadPermit, BulkheadRegistry, BulkheadSnapshot};
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitSnapshot, CircuitStatus, Transition};
pub use registry::CircuitRegistry;
