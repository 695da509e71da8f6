//! Counter backend trait for abstracting the shared store and the local fallback.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BackendError;

/// Which kind of store a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A store shared by every process (Redis).
    Shared,
    /// The per-process in-memory map.
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Shared => write!(f, "shared"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// State of a counter as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Hits observed in the current window
    pub count: u64,
    /// Time left until the window expires
    pub ttl: Duration,
}

impl WindowCount {
    /// The state reported for a key that has no live window.
    pub fn empty(window: Duration) -> Self {
        Self { count: 0, ttl: window }
    }
}

/// Trait for fixed-window counter stores.
///
/// Both implementations share the same semantics: the first hit in a window
/// sets the expiry, later hits never move it.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// The kind of store behind this backend.
    fn kind(&self) -> BackendKind;

    /// Atomically count one hit against `key`.
    ///
    /// Starts a new window of length `window` when the key is absent or expired.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, BackendError>;

    /// Read the current window without counting a hit.
    ///
    /// Returns `WindowCount::empty(window)` for absent or expired keys.
    async fn peek(&self, key: &str, window: Duration) -> Result<WindowCount, BackendError>;

    /// Clear the counter for `key`.
    async fn reset(&self, key: &str) -> Result<(), BackendError>;

    /// Cheap liveness probe.
    async fn is_healthy(&self) -> bool;
}
