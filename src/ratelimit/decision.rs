//! The result of an admission check.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Counted in the shared store.
    SharedStore,
    /// Counted in this process's fallback map.
    LocalFallback,
    /// No backend could be consulted; admitted by policy.
    FailOpen,
    /// No backend could be consulted; denied by policy.
    FailClosed,
}

impl DecisionSource {
    /// Whether the decision was made without any counter.
    pub fn is_policy(&self) -> bool {
        matches!(self, DecisionSource::FailOpen | DecisionSource::FailClosed)
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request is admitted
    pub allowed: bool,
    /// Requests left in the window
    pub remaining: u64,
    /// Counter value at the time of the check
    pub total_hits: u64,
    /// When the window this hit belongs to expires
    pub reset_time: DateTime<Utc>,
    /// The enforced limit
    pub limit: u64,
    /// Which path produced the decision
    pub source: DecisionSource,
}

impl RateLimitResult {
    /// Time until the window resets, as seen from `now`.
    pub fn retry_after_from(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_time - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time until the window resets.
    pub fn retry_after(&self) -> Duration {
        self.retry_after_from(Utc::now())
    }

    /// Response headers for an HTTP layer.
    ///
    /// `Retry-After` is only present on denials and is never below one second.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_time.timestamp().to_string()),
        ];

        if !self.allowed {
            let retry_after = self.retry_after();
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            headers.push(("Retry-After", secs.max(1).to_string()));
        }

        headers
    }
}
