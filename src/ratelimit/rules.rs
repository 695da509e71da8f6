//! Rate limit configurations and named presets.
//!
//! A `RateLimitConfig` is a plain value passed into every check. Named
//! presets (`api`, `webhook`, ...) are just a map of such values and can be
//! loaded from YAML.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, WardenError};

/// Configuration for one fixed-window limit.
///
/// Fields are signed so that a non-positive value coming from a config file
/// or a caller is representable. Such values are clamped, never rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window duration in milliseconds
    pub window_ms: i64,
    /// Requests admitted per window
    pub max_requests: i64,
    /// Namespace separating independent limiters sharing a backend
    #[serde(default)]
    pub key_prefix: String,
    /// Admit requests when the backend cannot be consulted (fail-open)
    #[serde(default = "default_skip_on_error")]
    pub skip_on_error: bool,
}

fn default_skip_on_error() -> bool {
    true
}

/// Longest window enforced; longer windows are capped to it.
pub const MAX_WINDOW: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// A limit after clamping, ready to be enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimit {
    /// Window duration, between one millisecond and `MAX_WINDOW`
    pub window: Duration,
    /// Requests admitted per window, at least one
    pub max_requests: u64,
}

impl RateLimitConfig {
    /// Create a fail-open configuration.
    pub fn new(window_ms: i64, max_requests: i64, key_prefix: &str) -> Self {
        Self {
            window_ms,
            max_requests,
            key_prefix: key_prefix.to_string(),
            skip_on_error: true,
        }
    }

    /// Set the failure policy.
    pub fn with_skip_on_error(mut self, skip_on_error: bool) -> Self {
        self.skip_on_error = skip_on_error;
        self
    }

    /// Deny requests when the backend cannot be consulted.
    pub fn fail_closed(self) -> Self {
        self.with_skip_on_error(false)
    }

    /// Whether both the window and the limit are positive.
    pub fn is_valid(&self) -> bool {
        self.window_ms > 0 && self.max_requests > 0
    }

    /// Clamp to `window_ms >= 1` and `max_requests >= 1`, and cap the window
    /// at `MAX_WINDOW`.
    pub fn effective(&self) -> EffectiveLimit {
        EffectiveLimit {
            window: Duration::from_millis(self.window_ms.max(1) as u64).min(MAX_WINDOW),
            max_requests: self.max_requests.max(1) as u64,
        }
    }
}

/// A set of named limit configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Presets {
    presets: HashMap<String, RateLimitConfig>,
}

impl Default for Presets {
    fn default() -> Self {
        let mut presets = HashMap::new();
        presets.insert("api".to_string(), RateLimitConfig::new(60_000, 100, "api"));
        presets.insert("webhook".to_string(), RateLimitConfig::new(60_000, 30, "webhook"));
        presets.insert(
            "auth".to_string(),
            RateLimitConfig::new(300_000, 5, "auth").fail_closed(),
        );
        Self { presets }
    }
}

impl Presets {
    /// Create an empty preset set.
    pub fn empty() -> Self {
        Self {
            presets: HashMap::new(),
        }
    }

    /// Load presets from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit presets");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load presets from a YAML mapping of name to configuration.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rate limit presets: {}", e)))
    }

    /// Look up a preset by name.
    pub fn get(&self, name: &str) -> Option<&RateLimitConfig> {
        self.presets.get(name)
    }

    /// Add or replace a preset.
    pub fn insert(&mut self, name: &str, config: RateLimitConfig) {
        self.presets.insert(name.to_string(), config);
    }

    /// Preset names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.presets.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of presets.
    pub fn len(&self) -> usize {
        self.presets.len()
    }

    /// Whether there are no presets.
    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}
