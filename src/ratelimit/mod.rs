//! Rate limiting logic, counter backends and degradation handling.

mod backend;
mod decision;
mod key;
mod limiter;
mod memory;
mod metrics;
mod redis_store;
mod rules;
mod sweeper;

pub use backend::{BackendKind, CounterBackend, WindowCount};
pub use decision::{DecisionSource, RateLimitResult};
pub use key::{build_key, WindowKey};
pub use limiter::{
    LimiterOptions, RateLimiter, RateLimiterBuilder, DEFAULT_RECOVERY_INTERVAL,
    DEFAULT_STORE_TIMEOUT,
};
pub use memory::{CounterEntry, InMemoryBackend};
pub use metrics::{HealthReport, LimiterMetrics, MetricsSnapshot};
pub use redis_store::RedisBackend;
pub use rules::{EffectiveLimit, Presets, RateLimitConfig, MAX_WINDOW};
pub use sweeper::{CleanupSweeper, SweeperHandle, DEFAULT_CLEANUP_INTERVAL};
