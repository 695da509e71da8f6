//! Configuration management for Warden.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, WardenError};
use crate::ratelimit::{LimiterOptions, Presets};

/// Prefix of environment variables overriding file configuration,
/// e.g. `WARDEN__STORE__URL`.
pub const ENV_PREFIX: &str = "WARDEN";

/// Main configuration for Warden.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WardenConfig {
    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Named rate limit presets
    #[serde(default)]
    pub presets: Presets,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; without one the limiter counts in-process only
    #[serde(default)]
    pub url: Option<String>,

    /// Bound on one store round trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix applied to every key in the store
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_timeout_ms(),
            namespace: default_namespace(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_namespace() -> String {
    "warden".to_string()
}

/// Limiter behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Fall back to per-process counting when the store fails
    #[serde(default = "default_degrade_to_local")]
    pub degrade_to_local: bool,

    /// Delay between recovery probes in milliseconds
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,

    /// Fallback cleanup interval in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            degrade_to_local: default_degrade_to_local(),
            recovery_interval_ms: default_recovery_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

fn default_degrade_to_local() -> bool {
    true
}

fn default_recovery_interval_ms() -> u64 {
    5000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

impl WardenConfig {
    /// Load configuration from an optional file, then apply `WARDEN__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            debug!(path = %path, "Reading configuration file");
            builder = builder.add_source(::config::File::with_name(path));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WardenError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file path, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| WardenError::Config(e.to_string()))
    }

    /// Limiter options derived from this configuration.
    pub fn limiter_options(&self) -> LimiterOptions {
        LimiterOptions {
            degrade_to_local: self.limiter.degrade_to_local,
            store_timeout: Duration::from_millis(self.store.timeout_ms.max(1)),
            recovery_interval: Duration::from_millis(self.limiter.recovery_interval_ms.max(1)),
            cleanup_interval: Duration::from_millis(self.limiter.cleanup_interval_ms.max(1)),
        }
    }
}
