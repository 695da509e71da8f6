//! Core rate limiter implementation.
//!
//! The limiter counts hits in a shared store when one is configured and
//! healthy. When the store fails, a check is either re-run against this
//! instance's in-memory fallback or resolved by the config's failure policy.
//! Checks never return an error.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::backend::{CounterBackend, WindowCount};
use super::decision::{DecisionSource, RateLimitResult};
use super::key::WindowKey;
use super::memory::InMemoryBackend;
use super::metrics::{HealthReport, LimiterMetrics, MetricsSnapshot};
use super::redis_store::RedisBackend;
use super::rules::{EffectiveLimit, RateLimitConfig};
use super::sweeper::{CleanupSweeper, SweeperHandle, DEFAULT_CLEANUP_INTERVAL};
use crate::config::WardenConfig;
use crate::error::{BackendError, Result};

/// Default bound on one shared-store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);
/// Default delay between recovery probes of a failed shared store.
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Tuning for a `RateLimiter`.
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Re-run checks against the local fallback when the shared store fails,
    /// instead of applying the failure policy straight away
    pub degrade_to_local: bool,
    /// Bound on every shared-store round trip; exceeding it counts as a failure
    pub store_timeout: Duration,
    /// Delay between liveness probes while the shared store is degraded
    pub recovery_interval: Duration,
    /// Interval of the fallback cleanup sweeper
    pub cleanup_interval: Duration,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            degrade_to_local: true,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            recovery_interval: DEFAULT_RECOVERY_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Connectivity state of the shared store, shared with the recovery probe.
#[derive(Debug)]
struct StoreState {
    connected: AtomicBool,
    probing: AtomicBool,
}

/// Builder for `RateLimiter`.
#[derive(Default)]
pub struct RateLimiterBuilder {
    shared: Option<Arc<dyn CounterBackend>>,
    options: LimiterOptions,
    sweeper: bool,
}

impl RateLimiterBuilder {
    /// Count hits in `backend` while it is healthy.
    pub fn shared_store(mut self, backend: Arc<dyn CounterBackend>) -> Self {
        self.shared = Some(backend);
        self
    }

    /// Replace the limiter options.
    pub fn options(mut self, options: LimiterOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the fallback cleanup sweeper for as long as the limiter lives.
    ///
    /// The sweeper is spawned on the tokio runtime current at `build`.
    pub fn with_sweeper(mut self) -> Self {
        self.sweeper = true;
        self
    }

    /// Build the limiter.
    pub fn build(self) -> RateLimiter {
        let instance_id = Uuid::new_v4();
        let fallback = Arc::new(InMemoryBackend::new());

        let sweeper = match (self.sweeper, tokio::runtime::Handle::try_current()) {
            (false, _) => None,
            (true, Ok(_)) => Some(CleanupSweeper::spawn(fallback.clone(), self.options.cleanup_interval)),
            (true, Err(_)) => {
                warn!(instance_id = %instance_id, "No tokio runtime, fallback cleanup sweeper not started");
                None
            }
        };

        debug!(
            instance_id = %instance_id,
            shared_store = self.shared.is_some(),
            degrade_to_local = self.options.degrade_to_local,
            "Creating rate limiter"
        );

        RateLimiter {
            instance_id,
            shared: self.shared,
            fallback,
            state: Arc::new(StoreState {
                connected: AtomicBool::new(true),
                probing: AtomicBool::new(false),
            }),
            metrics: LimiterMetrics::new(),
            options: self.options,
            warned_configs: Mutex::new(HashSet::new()),
            sweeper,
        }
    }
}

/// A fixed-window rate limiter with graceful degradation.
///
/// Each instance owns its fallback map, so independently configured limiters
/// never share local counters. This struct is thread-safe and can be shared
/// across tasks behind an `Arc`.
///
/// Expired fallback entries are only evicted by the cleanup sweeper.
/// `from_config` starts one tied to the limiter's lifetime; limiters built
/// by hand need `RateLimiterBuilder::with_sweeper` or `spawn_sweeper`.
pub struct RateLimiter {
    instance_id: Uuid,
    shared: Option<Arc<dyn CounterBackend>>,
    fallback: Arc<InMemoryBackend>,
    state: Arc<StoreState>,
    metrics: LimiterMetrics,
    options: LimiterOptions,
    /// `(window_ms, max_requests)` pairs already reported as invalid
    warned_configs: Mutex<HashSet<(i64, i64)>>,
    /// Sweeper started at build time, aborted when the limiter drops
    sweeper: Option<SweeperHandle>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("instance_id", &self.instance_id)
            .field("shared_store", &self.shared.as_ref().map(|s| s.kind()))
            .field("fallback_entries", &self.fallback.len())
            .field("options", &self.options)
            .field("sweeper", &self.sweeper.is_some())
            .finish()
    }
}

impl RateLimiter {
    /// Start building a limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// A limiter that only counts in-process.
    pub fn local() -> Self {
        Self::builder().build()
    }

    /// Build a limiter from loaded configuration.
    ///
    /// With a store URL configured, a Redis backend is attached; it connects
    /// on first use. The cleanup sweeper starts when called inside a tokio
    /// runtime.
    pub fn from_config(config: &WardenConfig) -> Result<Self> {
        let mut builder = Self::builder()
            .options(config.limiter_options())
            .with_sweeper();

        if let Some(url) = config.store.url.as_deref() {
            let backend = RedisBackend::new(url, &config.store.namespace)?;
            info!(namespace = %config.store.namespace, "Using Redis as shared counter store");
            builder = builder.shared_store(Arc::new(backend));
        } else {
            info!("No shared store configured, counting in-process only");
        }

        Ok(builder.build())
    }

    /// Identifier of this limiter instance.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Whether a shared store is attached.
    pub fn has_shared_store(&self) -> bool {
        self.shared.is_some()
    }

    /// The in-process fallback map.
    pub fn fallback(&self) -> &Arc<InMemoryBackend> {
        &self.fallback
    }

    /// The options this limiter was built with.
    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Whether a sweeper was started along with this limiter.
    pub fn has_sweeper(&self) -> bool {
        self.sweeper.as_ref().is_some_and(|s| !s.is_finished())
    }

    /// Start an extra cleanup sweeper for this limiter's fallback map, owned
    /// by the caller.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        CleanupSweeper::spawn(self.fallback.clone(), self.options.cleanup_interval)
    }

    /// Count one hit for `identifier` and decide whether it is admitted.
    pub async fn check_rate_limit(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let limit = self.effective_limit(config);
        let key = WindowKey::new(&config.key_prefix, identifier).to_string_key();

        trace!(
            key = %key,
            max_requests = limit.max_requests,
            window_ms = limit.window.as_millis() as u64,
            "Checking rate limit"
        );

        let result = match self.preferred_store() {
            Some(shared) => {
                match self.bounded(shared.increment(&key, limit.window)).await {
                    Ok(state) => {
                        self.mark_connected();
                        counted(state, limit, DecisionSource::SharedStore)
                    }
                    Err(e) => {
                        self.on_store_error(shared, &key, &e);
                        if self.options.degrade_to_local {
                            self.local_increment(&key, limit)
                        } else {
                            policy_result(config, limit, &key)
                        }
                    }
                }
            }
            None => self.local_increment(&key, limit),
        };

        self.metrics.record(&result);

        if !result.allowed {
            debug!(
                key = %key,
                total_hits = result.total_hits,
                limit = result.limit,
                source = ?result.source,
                "Rate limit exceeded"
            );
        }

        result
    }

    /// Report the state of `identifier`'s window without counting a hit.
    ///
    /// `allowed` tells whether the next request would be admitted.
    pub async fn get_rate_limit_status(&self, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let limit = self.effective_limit(config);
        let key = WindowKey::new(&config.key_prefix, identifier).to_string_key();

        match self.preferred_store() {
            Some(shared) => match self.bounded(shared.peek(&key, limit.window)).await {
                Ok(state) => {
                    self.mark_connected();
                    peeked(state, limit, DecisionSource::SharedStore)
                }
                Err(e) => {
                    self.on_store_error(shared, &key, &e);
                    if self.options.degrade_to_local {
                        self.local_peek(&key, limit)
                    } else {
                        policy_status(config, limit)
                    }
                }
            },
            None => self.local_peek(&key, limit),
        }
    }

    /// Clear `identifier`'s counter.
    ///
    /// The local fallback entry is always cleared. A failure to clear the
    /// shared entry is logged and otherwise ignored.
    pub async fn reset_rate_limit(&self, identifier: &str, config: &RateLimitConfig) {
        let key = WindowKey::new(&config.key_prefix, identifier).to_string_key();

        self.fallback.remove(&key);

        if let Some(shared) = &self.shared {
            match self.bounded(shared.reset(&key)).await {
                Ok(()) => self.mark_connected(),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to reset shared counter");
                    self.on_store_error(shared, &key, &e);
                }
            }
        }

        debug!(key = %key, "Rate limit reset");
    }

    /// Probe the shared store and report the limiter's health.
    pub async fn health_check(&self) -> HealthReport {
        let backend_connected = match &self.shared {
            Some(shared) => {
                let probe = shared.is_healthy();
                tokio::time::timeout(self.options.store_timeout, probe)
                    .await
                    .unwrap_or(false)
            }
            None => false,
        };

        HealthReport {
            instance_id: self.instance_id,
            backend_connected,
            fallback_active: self.is_fallback_active(),
            fallback_entry_count: self.fallback.len(),
        }
    }

    /// Counters and cached connectivity, without any I/O.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics
            .snapshot(self.is_store_connected(), self.fallback.len())
    }

    /// Whether the shared store is attached and was healthy on last contact.
    pub fn is_store_connected(&self) -> bool {
        self.shared.is_some() && self.state.connected.load(Ordering::Acquire)
    }

    /// Whether checks are currently counted in the local fallback.
    pub fn is_fallback_active(&self) -> bool {
        self.shared.is_none() || (self.options.degrade_to_local && !self.is_store_connected())
    }

    /// The store a check should try first, if any.
    fn preferred_store(&self) -> Option<&Arc<dyn CounterBackend>> {
        let shared = self.shared.as_ref()?;
        if self.options.degrade_to_local && !self.state.connected.load(Ordering::Acquire) {
            return None;
        }
        Some(shared)
    }

    async fn bounded<T, F>(&self, op: F) -> std::result::Result<T, BackendError>
    where
        F: Future<Output = std::result::Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.options.store_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.options.store_timeout)),
        }
    }

    fn effective_limit(&self, config: &RateLimitConfig) -> EffectiveLimit {
        if !config.is_valid()
            && self
                .warned_configs
                .lock()
                .insert((config.window_ms, config.max_requests))
        {
            warn!(
                key_prefix = %config.key_prefix,
                window_ms = config.window_ms,
                max_requests = config.max_requests,
                "Invalid rate limit config, clamping to window_ms >= 1 and max_requests >= 1"
            );
        }
        config.effective()
    }

    fn local_increment(&self, key: &str, limit: EffectiveLimit) -> RateLimitResult {
        let state = self.fallback.increment_at(key, limit.window, Instant::now());
        counted(state, limit, DecisionSource::LocalFallback)
    }

    fn local_peek(&self, key: &str, limit: EffectiveLimit) -> RateLimitResult {
        let state = self.fallback.peek_at(key, limit.window, Instant::now());
        peeked(state, limit, DecisionSource::LocalFallback)
    }

    fn mark_connected(&self) {
        if !self.state.connected.swap(true, Ordering::AcqRel) {
            info!(instance_id = %self.instance_id, "Shared counter store reachable again");
        }
    }

    fn on_store_error(&self, shared: &Arc<dyn CounterBackend>, key: &str, error: &BackendError) {
        self.metrics.record_backend_error();

        if self.state.connected.swap(false, Ordering::AcqRel) {
            warn!(
                instance_id = %self.instance_id,
                key = %key,
                error = %error,
                degrade_to_local = self.options.degrade_to_local,
                "Shared counter store unavailable; limits are now enforced per process"
            );
        } else {
            debug!(key = %key, error = %error, "Shared counter store still unavailable");
        }

        if self.options.degrade_to_local {
            self.spawn_recovery_probe(shared.clone());
        }
    }

    /// Probe the shared store until it answers, then route checks back to it.
    ///
    /// At most one probe runs at a time. The probe exits once the limiter is
    /// dropped.
    fn spawn_recovery_probe(&self, shared: Arc<dyn CounterBackend>) {
        if self.state.probing.swap(true, Ordering::AcqRel) {
            return;
        }

        let state: Weak<StoreState> = Arc::downgrade(&self.state);
        let interval = self.options.recovery_interval;
        let timeout = self.options.store_timeout;
        let instance_id = self.instance_id;

        tokio::spawn(async move {
            loop {
                let max_jitter = (interval.as_millis() / 10) as u64;
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter));
                tokio::time::sleep(interval + jitter).await;

                let Some(state) = state.upgrade() else {
                    return;
                };

                let healthy = tokio::time::timeout(timeout, shared.is_healthy())
                    .await
                    .unwrap_or(false);

                if healthy {
                    state.probing.store(false, Ordering::Release);
                    state.connected.store(true, Ordering::Release);
                    info!(instance_id = %instance_id, "Shared counter store recovered, leaving local fallback");
                    return;
                }

                trace!(instance_id = %instance_id, "Recovery probe failed, shared store still unavailable");
            }
        });
    }
}

/// Interpret a counted hit.
fn counted(state: WindowCount, limit: EffectiveLimit, source: DecisionSource) -> RateLimitResult {
    RateLimitResult {
        allowed: state.count <= limit.max_requests,
        remaining: limit.max_requests.saturating_sub(state.count),
        total_hits: state.count,
        reset_time: reset_time_after(state.ttl),
        limit: limit.max_requests,
        source,
    }
}

/// Interpret a window read without a hit.
fn peeked(state: WindowCount, limit: EffectiveLimit, source: DecisionSource) -> RateLimitResult {
    RateLimitResult {
        allowed: state.count < limit.max_requests,
        remaining: limit.max_requests.saturating_sub(state.count),
        total_hits: state.count,
        reset_time: reset_time_after(state.ttl),
        limit: limit.max_requests,
        source,
    }
}

/// Resolve a check that no backend could count.
fn policy_result(config: &RateLimitConfig, limit: EffectiveLimit, key: &str) -> RateLimitResult {
    let reset_time = reset_time_after(limit.window);

    if config.skip_on_error {
        warn!(key = %key, "Admitting request without counting (fail-open)");
        RateLimitResult {
            allowed: true,
            remaining: limit.max_requests - 1,
            total_hits: 1,
            reset_time,
            limit: limit.max_requests,
            source: DecisionSource::FailOpen,
        }
    } else {
        warn!(key = %key, "Denying request, counter store unavailable (fail-closed)");
        RateLimitResult {
            allowed: false,
            remaining: 0,
            total_hits: limit.max_requests,
            reset_time,
            limit: limit.max_requests,
            source: DecisionSource::FailClosed,
        }
    }
}

/// Resolve a status read that no backend could answer.
fn policy_status(config: &RateLimitConfig, limit: EffectiveLimit) -> RateLimitResult {
    let (allowed, remaining, source) = if config.skip_on_error {
        (true, limit.max_requests, DecisionSource::FailOpen)
    } else {
        (false, 0, DecisionSource::FailClosed)
    };

    RateLimitResult {
        allowed,
        remaining,
        total_hits: 0,
        reset_time: reset_time_after(limit.window),
        limit: limit.max_requests,
        source,
    }
}

/// `now + ttl`, saturating at the latest representable time.
fn reset_time_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::BackendKind;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// A shared store double that can be switched between working and failing.
    struct FlakyBackend {
        inner: InMemoryBackend,
        failing: AtomicBool,
        calls: AtomicUsize,
        delay: Option<Duration>,
        error: BackendError,
    }

    impl FlakyBackend {
        fn new(failing: bool) -> Self {
            Self {
                inner: InMemoryBackend::new(),
                failing: AtomicBool::new(failing),
                calls: AtomicUsize::new(0),
                delay: None,
                error: BackendError::Unavailable("connection refused".to_string()),
            }
        }

        /// Fails every call with a reply the backend cannot parse.
        fn garbled() -> Self {
            Self {
                error: BackendError::MalformedResponse("expected [count, pttl]".to_string()),
                ..Self::new(true)
            }
        }

        fn hanging(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(false)
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn enter(&self) -> std::result::Result<(), BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CounterBackend for FlakyBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Shared
        }

        async fn increment(&self, key: &str, window: Duration) -> std::result::Result<WindowCount, BackendError> {
            self.enter().await?;
            self.inner.increment(key, window).await
        }

        async fn peek(&self, key: &str, window: Duration) -> std::result::Result<WindowCount, BackendError> {
            self.enter().await?;
            self.inner.peek(key, window).await
        }

        async fn reset(&self, key: &str) -> std::result::Result<(), BackendError> {
            self.enter().await?;
            self.inner.reset(key).await
        }

        async fn is_healthy(&self) -> bool {
            !self.failing.load(Ordering::SeqCst)
        }
    }

    fn test_config(max_requests: i64) -> RateLimitConfig {
        RateLimitConfig::new(60_000, max_requests, "test:")
    }

    fn with_store(store: Arc<FlakyBackend>, options: LimiterOptions) -> RateLimiter {
        RateLimiter::builder().shared_store(store).options(options).build()
    }

    fn strict_options() -> LimiterOptions {
        LimiterOptions {
            degrade_to_local: false,
            ..LimiterOptions::default()
        }
    }

    #[tokio::test]
    async fn test_three_checks_against_limit_of_two() {
        let limiter = RateLimiter::local();
        let config = test_config(2);

        let first = limiter.check_rate_limit("X", &config).await;
        assert!(first.allowed);
        assert_eq!(first.total_hits, 1);
        assert_eq!(first.remaining, 1);

        let second = limiter.check_rate_limit("X", &config).await;
        assert!(second.allowed);
        assert_eq!(second.total_hits, 2);
        assert_eq!(second.remaining, 0);

        let third = limiter.check_rate_limit("X", &config).await;
        assert!(!third.allowed);
        assert_eq!(third.total_hits, 3);
        assert_eq!(third.remaining, 0);
        assert_eq!(third.limit, 2);
    }

    #[tokio::test]
    async fn test_shared_store_counts_monotonically() {
        let store = Arc::new(FlakyBackend::new(false));
        let limiter = with_store(store.clone(), LimiterOptions::default());
        let config = test_config(100);

        for expected in 1..=10 {
            let result = limiter.check_rate_limit("client", &config).await;
            assert_eq!(result.total_hits, expected);
            assert_eq!(result.source, DecisionSource::SharedStore);
        }

        assert_eq!(store.calls(), 10);
        assert!(limiter.fallback().is_empty());
    }

    #[tokio::test]
    async fn test_reset_time_is_window_expiry() {
        let limiter = RateLimiter::local();
        let config = test_config(5);

        let before = Utc::now();
        let result = limiter.check_rate_limit("client", &config).await;
        let after = Utc::now();

        assert!(result.reset_time >= before + chrono::Duration::seconds(59));
        assert!(result.reset_time <= after + chrono::Duration::seconds(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rollover() {
        let limiter = RateLimiter::local();
        let config = RateLimitConfig::new(1_000, 2, "test:");

        limiter.check_rate_limit("X", &config).await;
        limiter.check_rate_limit("X", &config).await;
        assert!(!limiter.check_rate_limit("X", &config).await.allowed);

        tokio::time::sleep(Duration::from_millis(1_001)).await;

        let result = limiter.check_rate_limit("X", &config).await;
        assert!(result.allowed);
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_burst_does_not_move_reset() {
        let limiter = RateLimiter::local();
        let config = RateLimitConfig::new(10_000, 100, "test:");

        limiter.check_rate_limit("X", &config).await;
        let key = WindowKey::new("test:", "X").to_string_key();
        let start_ttl = limiter.fallback().peek_at(&key, Duration::from_secs(10), Instant::now()).ttl;

        tokio::time::sleep(Duration::from_secs(8)).await;
        for _ in 0..20 {
            limiter.check_rate_limit("X", &config).await;
        }

        let state = limiter.fallback().peek_at(&key, Duration::from_secs(10), Instant::now());
        assert_eq!(state.count, 21);
        assert_eq!(state.ttl, start_ttl - Duration::from_secs(8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_the_limit() {
        let store = Arc::new(FlakyBackend::new(false));
        let limiter = Arc::new(with_store(store, LimiterOptions::default()));
        let config = test_config(50);

        let tasks: Vec<_> = (0..80)
            .map(|_| {
                let limiter = limiter.clone();
                let config = config.clone();
                tokio::spawn(async move { limiter.check_rate_limit("burst", &config).await })
            })
            .collect();

        let results: Vec<RateLimitResult> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let allowed = results.iter().filter(|r| r.allowed).count();
        assert_eq!(allowed, 50);
        assert_eq!(results.len() - allowed, 30);

        let metrics = limiter.metrics();
        assert_eq!(metrics.allowed, 50);
        assert_eq!(metrics.denied, 30);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_local_checks_admit_exactly_the_limit() {
        let limiter = Arc::new(RateLimiter::local());
        let config = test_config(25);

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let limiter = limiter.clone();
                let config = config.clone();
                tokio::spawn(async move { limiter.check_rate_limit("burst", &config).await.allowed })
            })
            .collect();

        let allowed = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(allowed, 25);
    }

    #[tokio::test]
    async fn test_fail_open_admits_on_store_error() {
        let store = Arc::new(FlakyBackend::new(true));
        let limiter = with_store(store, strict_options());
        let config = test_config(10);

        let result = limiter.check_rate_limit("client", &config).await;
        assert!(result.allowed);
        assert_eq!(result.total_hits, 1);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.source, DecisionSource::FailOpen);
    }

    #[tokio::test]
    async fn test_fail_closed_denies_on_store_error() {
        let store = Arc::new(FlakyBackend::new(true));
        let limiter = with_store(store, strict_options());
        let config = test_config(10).fail_closed();

        let result = limiter.check_rate_limit("client", &config).await;
        assert!(!result.allowed);
        assert_eq!(result.remaining, 0);
        assert_eq!(result.source, DecisionSource::FailClosed);

        let metrics = limiter.metrics();
        assert_eq!(metrics.fail_closed, 1);
        assert_eq!(metrics.backend_errors, 1);
        assert!(!metrics.backend_connected);
    }

    #[tokio::test]
    async fn test_strict_mode_keeps_trying_the_store() {
        let store = Arc::new(FlakyBackend::new(true));
        let limiter = with_store(store.clone(), strict_options());
        let config = test_config(10);

        limiter.check_rate_limit("client", &config).await;
        limiter.check_rate_limit("client", &config).await;
        assert_eq!(store.calls(), 2);

        store.set_failing(false);
        let result = limiter.check_rate_limit("client", &config).await;
        assert_eq!(result.source, DecisionSource::SharedStore);
        assert_eq!(result.total_hits, 1);
        assert!(limiter.is_store_connected());
    }

    #[tokio::test]
    async fn test_store_error_degrades_to_local_limiting() {
        let store = Arc::new(FlakyBackend::new(true));
        let limiter = with_store(store.clone(), LimiterOptions::default());
        let config = test_config(2).fail_closed();

        let first = limiter.check_rate_limit("client", &config).await;
        assert!(first.allowed);
        assert_eq!(first.source, DecisionSource::LocalFallback);

        // Once degraded, checks go straight to the fallback
        let second = limiter.check_rate_limit("client", &config).await;
        let third = limiter.check_rate_limit("client", &config).await;
        assert!(second.allowed);
        assert!(!third.allowed);
        assert_eq!(third.total_hits, 3);
        assert_eq!(store.calls(), 1);

        assert!(limiter.is_fallback_active());
        let metrics = limiter.metrics();
        assert_eq!(metrics.backend_errors, 1);
        assert_eq!(metrics.fallback_checks, 3);
        assert_eq!(metrics.fallback_entry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_counts_as_failure() {
        let store = Arc::new(FlakyBackend::hanging(Duration::from_secs(30)));
        let limiter = with_store(store, LimiterOptions::default());
        let config = test_config(5);

        let result = limiter.check_rate_limit("client", &config).await;
        assert!(result.allowed);
        assert_eq!(result.source, DecisionSource::LocalFallback);
        assert_eq!(limiter.metrics().backend_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_probe_restores_shared_store() {
        let store = Arc::new(FlakyBackend::new(true));
        let options = LimiterOptions {
            recovery_interval: Duration::from_secs(1),
            ..LimiterOptions::default()
        };
        let limiter = with_store(store.clone(), options);
        let config = test_config(10);

        let degraded = limiter.check_rate_limit("client", &config).await;
        assert_eq!(degraded.source, DecisionSource::LocalFallback);

        store.set_failing(false);
        // Interval plus at most 10% jitter
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        assert!(limiter.is_store_connected());
        let recovered = limiter.check_rate_limit("client", &config).await;
        assert_eq!(recovered.source, DecisionSource::SharedStore);
        assert_eq!(recovered.total_hits, 1);
    }

    #[tokio::test]
    async fn test_status_does_not_consume() {
        let limiter = RateLimiter::local();
        let config = test_config(3);

        let fresh = limiter.get_rate_limit_status("client", &config).await;
        assert!(fresh.allowed);
        assert_eq!(fresh.total_hits, 0);
        assert_eq!(fresh.remaining, 3);

        limiter.check_rate_limit("client", &config).await;
        for _ in 0..5 {
            let status = limiter.get_rate_limit_status("client", &config).await;
            assert_eq!(status.total_hits, 1);
            assert_eq!(status.remaining, 2);
        }

        let next = limiter.check_rate_limit("client", &config).await;
        assert_eq!(next.total_hits, 2);
        assert_eq!(limiter.metrics().checks, 2);
    }

    #[tokio::test]
    async fn test_status_reports_exhausted_window() {
        let store = Arc::new(FlakyBackend::new(false));
        let limiter = with_store(store, LimiterOptions::default());
        let config = test_config(2);

        limiter.check_rate_limit("client", &config).await;
        limiter.check_rate_limit("client", &config).await;

        let status = limiter.get_rate_limit_status("client", &config).await;
        assert!(!status.allowed);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.source, DecisionSource::SharedStore);
    }

    #[tokio::test]
    async fn test_status_on_store_error_follows_policy() {
        let store = Arc::new(FlakyBackend::new(true));
        let limiter = with_store(store, strict_options());

        let open = limiter.get_rate_limit_status("client", &test_config(4)).await;
        assert!(open.allowed);
        assert_eq!(open.remaining, 4);

        let closed = limiter
            .get_rate_limit_status("client", &test_config(4).fail_closed())
            .await;
        assert!(!closed.allowed);
        assert_eq!(closed.source, DecisionSource::FailClosed);
    }

    #[tokio::test]
    async fn test_reset_restores_clean_window() {
        let store = Arc::new(FlakyBackend::new(false));
        let limiter = with_store(store, LimiterOptions::default());
        let config = test_config(2);

        for _ in 0..3 {
            limiter.check_rate_limit("client", &config).await;
        }
        limiter.reset_rate_limit("client", &config).await;

        let result = limiter.check_rate_limit("client", &config).await;
        assert!(result.allowed);
        assert_eq!(result.total_hits, 1);
    }

    #[tokio::test]
    async fn test_reset_survives_store_error() {
        let store = Arc::new(FlakyBackend::new(true));
        let limiter = with_store(store, LimiterOptions::default());
        let config = test_config(1);

        limiter.check_rate_limit("client", &config).await;
        assert!(!limiter.check_rate_limit("client", &config).await.allowed);

        limiter.reset_rate_limit("client", &config).await;
        assert_eq!(limiter.check_rate_limit("client", &config).await.total_hits, 1);
    }

    #[tokio::test]
    async fn test_prefixes_are_separate_counters() {
        let limiter = RateLimiter::local();
        let api = RateLimitConfig::new(60_000, 1, "api");
        let webhook = RateLimitConfig::new(60_000, 1, "webhook");

        assert!(limiter.check_rate_limit("client", &api).await.allowed);
        assert!(limiter.check_rate_limit("client", &webhook).await.allowed);
        assert!(!limiter.check_rate_limit("client", &api).await.allowed);
    }

    #[tokio::test]
    async fn test_limiters_do_not_share_fallback_state() {
        let first = RateLimiter::local();
        let second = RateLimiter::local();
        let config = test_config(1);

        assert!(first.check_rate_limit("client", &config).await.allowed);
        assert!(second.check_rate_limit("client", &config).await.allowed);
        assert_ne!(first.instance_id(), second.instance_id());
    }

    #[tokio::test]
    async fn test_invalid_config_is_clamped() {
        let limiter = RateLimiter::local();
        let config = RateLimitConfig::new(60_000, 0, "test:");

        let first = limiter.check_rate_limit("client", &config).await;
        assert!(first.allowed);
        assert_eq!(first.limit, 1);

        let second = limiter.check_rate_limit("client", &config).await;
        assert!(!second.allowed);

        limiter.check_rate_limit("client", &RateLimitConfig::new(0, 5, "other")).await;
        assert_eq!(limiter.warned_configs.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_configs_warn_once_per_limit() {
        let limiter = RateLimiter::local();

        for prefix in ["a", "b", "c", "d"] {
            limiter
                .check_rate_limit("client", &RateLimitConfig::new(60_000, 0, prefix))
                .await;
        }
        assert_eq!(limiter.warned_configs.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_huge_window_does_not_overflow() {
        let limiter = RateLimiter::local();

        for window_ms in [i64::MAX, 10_000_000_000_000_000] {
            let config = RateLimitConfig::new(window_ms, 5, "huge");
            let result = limiter.check_rate_limit("client", &config).await;
            assert!(result.allowed);
            assert_eq!(result.limit, 5);
            assert!(result.reset_time > Utc::now() + chrono::Duration::days(365));

            let status = limiter.get_rate_limit_status("client", &config).await;
            assert!(status.allowed);
            assert!(status.retry_after() > Duration::ZERO);
        }
    }

    #[test]
    fn test_reset_time_saturates() {
        assert_eq!(reset_time_after(Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_malformed_reply_degrades_to_local_limiting() {
        let store = Arc::new(FlakyBackend::garbled());
        let limiter = with_store(store, LimiterOptions::default());
        let config = test_config(1).fail_closed();

        let first = limiter.check_rate_limit("client", &config).await;
        assert!(first.allowed);
        assert_eq!(first.source, DecisionSource::LocalFallback);

        let second = limiter.check_rate_limit("client", &config).await;
        assert!(!second.allowed);
        assert_eq!(second.source, DecisionSource::LocalFallback);
        assert_eq!(limiter.metrics().backend_errors, 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_follows_policy_in_strict_mode() {
        let store = Arc::new(FlakyBackend::garbled());
        let limiter = with_store(store, strict_options());

        let open = limiter.check_rate_limit("client", &test_config(3)).await;
        assert!(open.allowed);
        assert_eq!(open.source, DecisionSource::FailOpen);

        let closed = limiter
            .check_rate_limit("client", &test_config(3).fail_closed())
            .await;
        assert!(!closed.allowed);
        assert_eq!(closed.source, DecisionSource::FailClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_from_config_sweeps_fallback() {
        let config = WardenConfig::from_yaml("limiter:\n  cleanup_interval_ms: 1000\n").unwrap();
        let limiter = RateLimiter::from_config(&config).unwrap();
        assert!(limiter.has_sweeper());

        limiter
            .check_rate_limit("client", &RateLimitConfig::new(100, 5, "short"))
            .await;
        assert_eq!(limiter.fallback().len(), 1);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(limiter.fallback().is_empty());
    }

    #[test]
    fn test_sweeper_needs_runtime() {
        let limiter = RateLimiter::builder().with_sweeper().build();
        assert!(!limiter.has_sweeper());
        assert!(!RateLimiter::local().has_sweeper());
    }

    #[tokio::test]
    async fn test_health_check_reports_store_state() {
        let store = Arc::new(FlakyBackend::new(false));
        let limiter = with_store(store.clone(), LimiterOptions::default());

        let health = limiter.health_check().await;
        assert!(health.backend_connected);
        assert!(!health.fallback_active);
        assert_eq!(health.instance_id, limiter.instance_id());

        store.set_failing(true);
        limiter.check_rate_limit("client", &test_config(5)).await;

        let health = limiter.health_check().await;
        assert!(!health.backend_connected);
        assert!(health.fallback_active);
        assert_eq!(health.fallback_entry_count, 1);
    }

    #[tokio::test]
    async fn test_local_limiter_health() {
        let limiter = RateLimiter::local();
        let health = limiter.health_check().await;

        assert!(!health.backend_connected);
        assert!(health.fallback_active);
        assert!(!limiter.metrics().backend_connected);
    }
}
