//! Start-up settings: defaults, adaptive tunables, per-endpoint overrides
//! and custom profiles, loadable from JSON or YAML.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::profiles;
use super::types::{ConfigChanges, EndpointConfig};
use crate::policy::AdaptiveConfig;
use crate::telemetry::DEFAULT_SAMPLE_SIZE;

/// Errors from loading or validating [`GuardSettings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported settings format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid settings: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Start-up changes for one endpoint. The profile, if any, is applied
/// first; `changes` are merged on top.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EndpointOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<ConfigChanges>,
}

/// Everything a [`Guard`](crate::Guard) is built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    /// Config every endpoint starts with.
    pub defaults: EndpointConfig,
    pub adaptive: AdaptiveConfig,
    /// Superseded versions kept per endpoint.
    pub max_history: usize,
    /// Recent call durations kept per endpoint.
    pub sample_size: usize,
    pub endpoints: HashMap<String, EndpointOverride>,
    pub custom_profiles: HashMap<String, EndpointConfig>,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            defaults: EndpointConfig::default(),
            adaptive: AdaptiveConfig::default(),
            max_history: 50,
            sample_size: DEFAULT_SAMPLE_SIZE,
            endpoints: HashMap::new(),
            custom_profiles: HashMap::new(),
        }
    }
}

impl GuardSettings {
    pub fn from_json_str(s: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_str(s: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_yaml::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Self::from_json_str(&std::fs::read_to_string(path)?),
            "yaml" | "yml" => Self::from_yaml_str(&std::fs::read_to_string(path)?),
            _ => Err(SettingsError::UnsupportedFormat(path.display().to_string())),
        }
    }

    /// Check every config these settings contain, reporting all problems.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let mut problems = Vec::new();

        if let Err(fields) = self.defaults.validate() {
            problems.extend(fields.iter().map(|f| format!("defaults: {f}")));
        }

        let a = &self.adaptive;
        if !(a.adaptation_factor > 0.0 && a.adaptation_factor < 1.0) {
            problems.push("adaptive: adaptation_factor must be in (0, 1)".to_string());
        }
        if a.min_threshold == 0 {
            problems.push("adaptive: min_threshold must be positive".to_string());
        }
        if a.min_threshold > a.max_threshold {
            problems.push("adaptive: min_threshold exceeds max_threshold".to_string());
        }
        if a.enabled && a.update_interval.is_zero() {
            problems.push("adaptive: update_interval_ms must be positive".to_string());
        }

        let mut names: Vec<&String> = self.custom_profiles.keys().collect();
        names.sort();
        for name in names {
            if profiles::is_builtin(name) {
                problems.push(format!("profile {name}: shadows a built-in profile"));
            }
            if let Err(fields) = self.custom_profiles[name].validate() {
                problems.extend(fields.iter().map(|f| format!("profile {name}: {f}")));
            }
        }

        let mut endpoints: Vec<&String> = self.endpoints.keys().collect();
        endpoints.sort();
        for endpoint in endpoints {
            let ov = &self.endpoints[endpoint];
            let base = match &ov.profile {
                Some(p) => match self.resolve_profile(p) {
                    Some(cfg) => cfg,
                    None => {
                        problems.push(format!("endpoint {endpoint}: unknown profile {p}"));
                        continue;
                    }
                },
                None => self.defaults,
            };
            if let Some(changes) = &ov.changes {
                if let Err(fields) = changes.apply_to(&base) {
                    problems.extend(fields.iter().map(|f| format!("endpoint {endpoint}: {f}")));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(problems))
        }
    }

    fn resolve_profile(&self, name: &str) -> Option<EndpointConfig> {
        profiles::builtin(name).or_else(|| self.custom_profiles.get(name).copied())
    }
}
