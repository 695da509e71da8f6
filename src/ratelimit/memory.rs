//! In-process fallback counter backend.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::backend::{BackendKind, CounterBackend, WindowCount};
use super::rules::MAX_WINDOW;
use crate::error::BackendError;

/// A fixed-window counter owned by the in-memory backend.
#[derive(Debug, Clone, Copy)]
pub struct CounterEntry {
    /// Hits observed in the current window
    pub count: u64,
    /// When the current window started (first hit)
    pub window_start: Instant,
    /// When the current window ends
    pub expires_at: Instant,
}

impl CounterEntry {
    fn open(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            expires_at: now
                .checked_add(window)
                .unwrap_or_else(|| now + MAX_WINDOW),
        }
    }

    /// Whether a hit at `now` belongs to a new window.
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A concurrency-safe in-memory counter map.
///
/// Every mutation of a key runs while holding the write lock of the shard
/// that key lives in, so concurrent increments on a key are serialized and
/// the sweeper never removes an entry in the middle of an update.
///
/// Counts are local to this process. While a fleet runs on its fallbacks the
/// effective limit is `max_requests` times the number of live processes.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: DashMap<String, CounterEntry>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one hit against `key` at the given instant.
    pub fn increment_at(&self, key: &str, window: Duration, now: Instant) -> WindowCount {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CounterEntry::open(now, window));

        if entry.is_expired(now) {
            trace!(key = %key, "Starting new local window");
            *entry = CounterEntry::open(now, window);
        }

        entry.count += 1;

        WindowCount {
            count: entry.count,
            ttl: entry.expires_at.saturating_duration_since(now),
        }
    }

    /// Read the window for `key` at the given instant without counting a hit.
    pub fn peek_at(&self, key: &str, window: Duration, now: Instant) -> WindowCount {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => WindowCount {
                count: entry.count,
                ttl: entry.expires_at.saturating_duration_since(now),
            },
            _ => WindowCount::empty(window),
        }
    }

    /// Remove the counter for `key`. Returns whether one existed.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry strictly past its expiry as of `now`.
    ///
    /// Returns the number of entries removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let live = now <= entry.expires_at;
            if !live {
                removed += 1;
            }
            live
        });
        removed
    }

    /// Remove every expired entry.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Number of tracked keys, live or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[async_trait]
impl CounterBackend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount, BackendError> {
        Ok(self.increment_at(key, window, Instant::now()))
    }

    async fn peek(&self, key: &str, window: Duration) -> Result<WindowCount, BackendError> {
        Ok(self.peek_at(key, window, Instant::now()))
    }

    async fn reset(&self, key: &str) -> Result<(), BackendError> {
        self.remove(key);
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        true
    }
}
