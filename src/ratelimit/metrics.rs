//! Decision counters and health reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use uuid::Uuid;

use super::decision::{DecisionSource, RateLimitResult};

/// Monotonic counters updated on every check.
///
/// Exact interleaving between counters does not matter, so all updates are
/// relaxed.
#[derive(Debug, Default)]
pub struct LimiterMetrics {
    checks: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
    backend_errors: AtomicU64,
    fallback_checks: AtomicU64,
    fail_open: AtomicU64,
    fail_closed: AtomicU64,
}

impl LimiterMetrics {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a counting check.
    pub fn record(&self, result: &RateLimitResult) {
        self.checks.fetch_add(1, Ordering::Relaxed);

        if result.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }

        let counter = match result.source {
            DecisionSource::SharedStore => return,
            DecisionSource::LocalFallback => &self.fallback_checks,
            DecisionSource::FailOpen => &self.fail_open,
            DecisionSource::FailClosed => &self.fail_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed backend round trip.
    pub fn record_backend_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters.
    pub fn snapshot(&self, backend_connected: bool, fallback_entry_count: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            backend_connected,
            fallback_entry_count,
            checks: self.checks.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            fallback_checks: self.fallback_checks.load(Ordering::Relaxed),
            fail_open: self.fail_open.load(Ordering::Relaxed),
            fail_closed: self.fail_closed.load(Ordering::Relaxed),
        }
    }
}

/// Lightweight metrics, safe to poll frequently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Last known state of the shared store (no probe is made)
    pub backend_connected: bool,
    /// Keys held by the fallback map
    pub fallback_entry_count: usize,
    pub checks: u64,
    pub allowed: u64,
    pub denied: u64,
    pub backend_errors: u64,
    pub fallback_checks: u64,
    pub fail_open: u64,
    pub fail_closed: u64,
}

/// Health of a limiter instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Identifies the limiter instance in logs
    pub instance_id: Uuid,
    /// Result of a liveness probe against the shared store
    pub backend_connected: bool,
    /// Whether checks are currently counted locally
    pub fallback_active: bool,
    /// Keys held by the fallback map
    pub fallback_entry_count: usize,
}
