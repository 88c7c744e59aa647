//! Exact sliding-window admission via a server-side script.
//!
//! Runs prune, count and the conditional insert as one Lua script, which Redis
//! executes atomically. Unlike [`super::SlidingWindowCounter`] this never
//! admits more than `limit` operations per window, whatever the concurrency,
//! and never records a denied operation. Every insert refreshes the key's
//! expiry to one window, so sets of idle callers disappear on their own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use redis::Script;
use tracing::{debug, error, trace};
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::request::{AdmissionRequest, AdmissionResult};
use super::sliding_window::DEFAULT_OPERATION_TIMEOUT;
use super::strategy::Strategy;
use crate::error::{Result, ZlimitError};
use crate::store::{RedisStore, StoreError};

const SLIDING_WINDOW_SCRIPT: &str = r#"
    local key = KEYS[1]

    local now_ms = tonumber(ARGV[1])
    local window_start = tonumber(ARGV[2])
    local limit = tonumber(ARGV[3])
    local member = ARGV[4]
    local window_ms = tonumber(ARGV[5])

    redis.call("ZREMRANGEBYSCORE", key, 0, window_start)

    local count = redis.call("ZCARD", key)
    if count >= limit then
        return {0, count}
    end

    redis.call("ZADD", key, now_ms, member)
    redis.call("PEXPIRE", key, window_ms)
    return {1, count + 1}
"#;

/// Hard-enforcing sliding-window rate limiter for Redis.
pub struct ScriptedSlidingWindow {
    store: RedisStore,
    script: Script,
    clock: Arc<dyn Clock>,
    operation_timeout: Duration,
}

impl ScriptedSlidingWindow {
    pub fn new(store: RedisStore) -> Self {
        Self {
            store,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            clock: Arc::new(SystemClock),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}

#[async_trait]
impl Strategy for ScriptedSlidingWindow {
    async fn evaluate(&self, request: &AdmissionRequest) -> Result<AdmissionResult> {
        let key = request.key();
        let now = self.clock.now();
        let now_ms = now.timestamp_millis();
        let window_start = now_ms - request.window_ms();
        let expires_at = now
            .checked_add_signed(TimeDelta::milliseconds(request.window_ms()))
            .ok_or_else(|| {
                ZlimitError::InvalidRequest(format!(
                    "window of {}ms overflows the clock",
                    request.window_ms()
                ))
            })?;

        trace!(key = %key, limit = request.limit(), window_start, "Evaluating scripted window");

        let mut connection = self.store.connection();
        let redis_key = self.store.namespaced_key(key);
        let invoke = async {
            let reply: (u8, u64) = self
                .script
                .key(&redis_key)
                .arg(now_ms)
                .arg(window_start)
                .arg(request.limit())
                .arg(Uuid::new_v4().to_string())
                .arg(request.window_ms())
                .invoke_async(&mut connection)
                .await?;
            Ok::<_, StoreError>(reply)
        };

        let outcome = tokio::time::timeout(self.operation_timeout, invoke)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.operation_timeout)));

        let (admitted, total) = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                error!(key = %key, error = %err, "Sliding window script failed");
                return Err(ZlimitError::from_store(key, "run sliding window script", err));
            }
        };

        if admitted == 0 {
            debug!(key = %key, total, limit = request.limit(), "Rate limit exceeded");
            return Ok(AdmissionResult::deny(total, expires_at));
        }

        Ok(AdmissionResult::allow(total, expires_at))
    }
}
