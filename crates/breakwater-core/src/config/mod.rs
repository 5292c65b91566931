//! Per-endpoint configuration: types, built-in profiles, the versioned
//! manager, and start-up settings.

pub mod manager;
pub mod profiles;
pub mod settings;
pub mod types;

pub use manager::{ConfigHistoryEntry, ConfigManager, ConfigSnapshot, ConfigSubscriber};
pub use profiles::{ProfileTag, BUILTIN_PROFILES};
pub use settings::{EndpointOverride, GuardSettings, SettingsError};
pub use types::{BulkheadChanges, BulkheadConfig, CircuitConfig, ConfigChanges, EndpointConfig};

pub(crate) use types::duration_ms;
