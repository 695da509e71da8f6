//! Shared counter backend on Redis.
//!
//! The increment runs as a Lua script so that counting the hit and setting
//! the window expiry happen in one atomic round trip. Round trips are not
//! bounded here; the limiter core wraps every shared-store call in its own
//! timeout.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use super::backend::{BackendKind, CounterBackend, WindowCount};
use crate::error::{BackendError, Result, WardenError};

const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::TypeError {
            BackendError::MalformedResponse(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

/// A counter backend shared by every process pointing at the same Redis.
///
/// The connection is established on first use, so a store that is down at
/// startup shows up as `BackendError` on checks instead of failing
/// construction.
pub struct RedisBackend {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    namespace: String,
    script: Script,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("namespace", &self.namespace)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl RedisBackend {
    /// Create a backend for the given Redis URL.
    ///
    /// Only the URL is validated here; no connection is made.
    pub fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| WardenError::Config(format!("Invalid Redis URL '{}': {}", url, e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            namespace: namespace.to_string(),
            script: Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Prefix applied to every key in the store.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn store_key(&self, key: &str) -> String {
        if self.namespace.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.namespace, key)
        }
    }

    async fn connection(&self) -> std::result::Result<ConnectionManager, BackendError> {
        self.connection
            .get_or_try_init(|| async move {
                debug!("Connecting to Redis counter store");
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(BackendError::from)
            })
            .await
            .cloned()
    }
}

/// Interpret the script reply as `(count, ttl_ms)`.
fn parse_increment_reply(reply: &redis::Value) -> std::result::Result<WindowCount, BackendError> {
    let values: Vec<i64> = redis::from_redis_value(reply)
        .map_err(|e| BackendError::MalformedResponse(e.to_string()))?;

    match values.as_slice() {
        [count, ttl_ms] if *count >= 1 && *ttl_ms >= 0 => Ok(WindowCount {
            count: *count as u64,
            ttl: Duration::from_millis(*ttl_ms as u64),
        }),
        other => Err(BackendError::MalformedResponse(format!(
            "expected [count >= 1, ttl >= 0], got {:?}",
            other
        ))),
    }
}

#[async_trait]
impl CounterBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shared
    }

    async fn increment(&self, key: &str, window: Duration) -> std::result::Result<WindowCount, BackendError> {
        let store_key = self.store_key(key);
        let window_ms = window.as_millis().max(1) as u64;

        let mut conn = self.connection().await?;
        let reply: redis::Value = self
            .script
            .key(&store_key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;
        let state = parse_increment_reply(&reply)?;

        trace!(
            key = %store_key,
            count = state.count,
            ttl_ms = state.ttl.as_millis() as u64,
            "Incremented shared counter"
        );
        Ok(state)
    }

    async fn peek(&self, key: &str, window: Duration) -> std::result::Result<WindowCount, BackendError> {
        let store_key = self.store_key(key);

        let mut conn = self.connection().await?;
        let (count, ttl_ms): (Option<u64>, i64) = redis::pipe()
            .cmd("GET")
            .arg(&store_key)
            .cmd("PTTL")
            .arg(&store_key)
            .query_async(&mut conn)
            .await?;

        // PTTL is -2 for a missing key and -1 for a key without expiry
        Ok(match count {
            Some(count) if count > 0 && ttl_ms > 0 => WindowCount {
                count,
                ttl: Duration::from_millis(ttl_ms as u64),
            },
            _ => WindowCount::empty(window),
        })
    }

    async fn reset(&self, key: &str) -> std::result::Result<(), BackendError> {
        let store_key = self.store_key(key);

        let mut conn = self.connection().await?;
        let _: () = conn.del(&store_key).await?;
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        let probe: std::result::Result<String, BackendError> = async {
            let mut conn = self.connection().await?;
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(pong)
        }
        .await;

        match probe {
            Ok(pong) => pong.eq_ignore_ascii_case("PONG"),
            Err(e) => {
                debug!(error = %e, "Redis liveness probe failed");
                false
            }
        }
    }
}
