//! Configuration manager — the single writer of live per-endpoint config.
//!
//! Update, profile and reset all follow the same path: validate, push the
//! prior record into history, bump the version, and notify subscribers while
//! the endpoint's record lock is still held. The lock ordering is
//! record → subscriber, so live components always observe versions in
//! commit order.
//!
//! Rollback consumes the newest history entry and restores it as a
//! brand-new version; version numbers are never reused.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::profiles::{self, ProfileTag, BUILTIN_PROFILES};
use super::types::{ConfigChanges, EndpointConfig};
use crate::error::GuardError;
use crate::events::{EventBus, EventKind};
use crate::lock::{lock, read, write};

/// Receives every committed config change.
///
/// Called with the endpoint's record lock held; implementations must not
/// call back into the [`ConfigManager`].
pub trait ConfigSubscriber: Send + Sync {
    fn config_changed(&self, endpoint: &str, config: &EndpointConfig);
}

/// A superseded config version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigHistoryEntry {
    pub config: EndpointConfig,
    pub profile: ProfileTag,
    pub version: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Point-in-time view of an endpoint's config record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub endpoint: String,
    pub config: EndpointConfig,
    pub profile: ProfileTag,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub history_len: usize,
}

struct ConfigRecord {
    config: EndpointConfig,
    profile: ProfileTag,
    version: u64,
    updated_at: DateTime<Utc>,
    history: VecDeque<ConfigHistoryEntry>,
}

impl ConfigRecord {
    fn initial(config: EndpointConfig) -> Self {
        Self {
            config,
            profile: ProfileTag::Default,
            version: 1,
            updated_at: Utc::now(),
            history: VecDeque::new(),
        }
    }
}

/// Why a commit happened; decides which event is emitted.
enum Mutation {
    Update,
    Profile(String),
    Reset,
}

/// Versioned per-endpoint configuration store.
pub struct ConfigManager {
    defaults: EndpointConfig,
    max_history: usize,
    records: RwLock<HashMap<String, Arc<Mutex<ConfigRecord>>>>,
    custom_profiles: RwLock<HashMap<String, EndpointConfig>>,
    subscribers: RwLock<Vec<Arc<dyn ConfigSubscriber>>>,
    events: EventBus,
}

impl ConfigManager {
    /// Create a manager whose new endpoints start from `defaults`.
    pub fn new(defaults: EndpointConfig, max_history: usize, events: EventBus) -> Self {
        Self {
            defaults,
            max_history: max_history.max(1),
            records: RwLock::new(HashMap::new()),
            custom_profiles: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Register a live component to be told about every commit.
    pub fn subscribe(&self, subscriber: Arc<dyn ConfigSubscriber>) {
        write(&self.subscribers).push(subscriber);
    }

    /// The config new endpoints start with.
    pub fn defaults(&self) -> &EndpointConfig {
        &self.defaults
    }

    /// Current effective config, creating the default record on first access.
    pub fn get_config(&self, endpoint: &str) -> EndpointConfig {
        lock(&self.record(endpoint)).config
    }

    /// Full view of the endpoint's record.
    pub fn snapshot(&self, endpoint: &str) -> ConfigSnapshot {
        let record = self.record(endpoint);
        let rec = lock(&record);
        ConfigSnapshot {
            endpoint: endpoint.to_string(),
            config: rec.config,
            profile: rec.profile.clone(),
            version: rec.version,
            updated_at: rec.updated_at,
            history_len: rec.history.len(),
        }
    }

    /// Superseded versions, oldest first.
    pub fn history(&self, endpoint: &str) -> Vec<ConfigHistoryEntry> {
        lock(&self.record(endpoint)).history.iter().cloned().collect()
    }

    /// Endpoints with a config record.
    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.records).keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate and merge `changes`. Nothing is stored if any field is invalid.
    pub fn update(&self, endpoint: &str, changes: &ConfigChanges) -> Result<u64, GuardError> {
        let record = self.record(endpoint);
        let mut rec = lock(&record);
        let merged = changes
            .apply_to(&rec.config)
            .map_err(GuardError::InvalidConfig)?;
        Ok(self.commit(endpoint, &mut rec, merged, ProfileTag::Custom, Mutation::Update))
    }

    /// Replace the whole config with a built-in or registered profile.
    pub fn apply_profile(&self, endpoint: &str, name: &str) -> Result<u64, GuardError> {
        let config = self
            .profile(name)
            .ok_or_else(|| GuardError::UnknownProfile(name.to_string()))?;
        let record = self.record(endpoint);
        let mut rec = lock(&record);
        Ok(self.commit(
            endpoint,
            &mut rec,
            config,
            ProfileTag::Named(name.to_string()),
            Mutation::Profile(name.to_string()),
        ))
    }

    /// Restore the most recent history entry as a new version.
    ///
    /// The restored entry is consumed, so repeated rollbacks walk further
    /// back through history.
    pub fn rollback(&self, endpoint: &str) -> Result<u64, GuardError> {
        let record = self.record(endpoint);
        let mut rec = lock(&record);
        let entry = rec.history.pop_back().ok_or_else(|| GuardError::NoHistory {
            endpoint: endpoint.to_string(),
        })?;

        let version = rec.version + 1;
        rec.config = entry.config;
        rec.profile = entry.profile;
        rec.version = version;
        rec.updated_at = Utc::now();
        self.notify(endpoint, &rec.config);
        drop(rec);

        tracing::info!(
            endpoint,
            version,
            restored_version = entry.version,
            "config rolled back"
        );
        self.events.emit(
            endpoint,
            EventKind::ConfigRollback {
                version,
                restored_version: entry.version,
            },
        );
        Ok(version)
    }

    /// Replace the config with the hard-coded defaults.
    pub fn reset_to_default(&self, endpoint: &str) -> Result<u64, GuardError> {
        let record = self.record(endpoint);
        let mut rec = lock(&record);
        Ok(self.commit(endpoint, &mut rec, self.defaults, ProfileTag::Default, Mutation::Reset))
    }

    /// Register (or replace) a custom profile.
    pub fn register_profile(&self, name: &str, config: EndpointConfig) -> Result<(), GuardError> {
        if profiles::is_builtin(name) {
            return Err(GuardError::ReservedProfile(name.to_string()));
        }
        config.validate().map_err(GuardError::InvalidConfig)?;
        write(&self.custom_profiles).insert(name.to_string(), config);
        tracing::debug!(profile = name, "custom profile registered");
        Ok(())
    }

    /// Resolve a profile: built-ins first, then custom profiles.
    pub fn profile(&self, name: &str) -> Option<EndpointConfig> {
        profiles::builtin(name).or_else(|| read(&self.custom_profiles).get(name).copied())
    }

    /// All profile names: built-ins in fixed order, then custom ones sorted.
    pub fn profiles(&self) -> Vec<String> {
        let mut custom: Vec<String> = read(&self.custom_profiles).keys().cloned().collect();
        custom.sort();
        BUILTIN_PROFILES
            .iter()
            .map(|s| s.to_string())
            .chain(custom)
            .collect()
    }

    fn record(&self, endpoint: &str) -> Arc<Mutex<ConfigRecord>> {
        if let Some(rec) = read(&self.records).get(endpoint) {
            return rec.clone();
        }
        write(&self.records)
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ConfigRecord::initial(self.defaults))))
            .clone()
    }

    fn commit(
        &self,
        endpoint: &str,
        rec: &mut ConfigRecord,
        config: EndpointConfig,
        profile: ProfileTag,
        mutation: Mutation,
    ) -> u64 {
        let prior = ConfigHistoryEntry {
            config: rec.config,
            profile: std::mem::replace(&mut rec.profile, profile),
            version: rec.version,
            recorded_at: rec.updated_at,
        };
        rec.history.push_back(prior);
        while rec.history.len() > self.max_history {
            rec.history.pop_front();
        }

        rec.config = config;
        rec.version += 1;
        rec.updated_at = Utc::now();
        let version = rec.version;
        self.notify(endpoint, &rec.config);

        let kind = match mutation {
            Mutation::Update => EventKind::ConfigUpdated { version },
            Mutation::Profile(profile) => EventKind::ProfileApplied { profile, version },
            Mutation::Reset => EventKind::ConfigReset { version },
        };
        tracing::info!(endpoint, version, change = kind.name(), "config committed");
        self.events.emit(endpoint, kind);
        version
    }

    fn notify(&self, endpoint: &str, config: &EndpointConfig) {
        for subscriber in read(&self.subscribers).iter() {
            subscriber.config_changed(endpoint, config);
        }
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager")
            .field("defaults", &self.defaults)
            .field("endpoints", &self.endpoints())
            .finish()
    }
}
