//! Redis sorted-set store.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tracing::{error, trace};

use super::{Batch, BatchCommand, BatchReplies, ScoreBound, ScoredSetStore, StoreError};

/// Default namespace for every key written by zlimit.
pub const DEFAULT_KEY_PREFIX: &str = "zlimit";

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_io_error()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// A [`ScoredSetStore`] backed by Redis sorted sets.
///
/// Keys are namespaced as `<prefix>:<caller key>`. Batches are sent as a
/// non-transactional pipeline, so commands from other clients may interleave
/// with them. Requires a Redis server that supports ZADD/ZCOUNT/ZREMRANGEBYSCORE
/// (any maintained release).
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    prefix: Arc<str>,
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(connection_manager: ConnectionManager, prefix: &str) -> Self {
        Self {
            connection_manager,
            prefix: Arc::from(prefix),
        }
    }

    /// Open a connection manager to `url` and wrap it.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection_manager = client.get_connection_manager().await.map_err(|e| {
            error!(url = %url, error = %e, "Failed to connect to redis");
            StoreError::from(e)
        })?;
        Ok(Self::new(connection_manager, prefix))
    }

    /// The namespace prepended to caller keys.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The Redis key holding the activity records of `key`.
    pub fn namespaced_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// A handle on the shared multiplexed connection.
    pub(crate) fn connection(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    fn build_pipeline(&self, key: &str, batch: &Batch) -> redis::Pipeline {
        let mut pipe = redis::pipe();
        for command in batch.commands() {
            match command {
                BatchCommand::RemoveRangeByScore { min, max } => {
                    pipe.zrembyscore(key, min.to_string(), max.to_string());
                }
                BatchCommand::Add { score, member } => {
                    pipe.zadd(key, member.as_str(), *score);
                }
                BatchCommand::Count { min, max } => {
                    pipe.zcount(key, min.to_string(), max.to_string());
                }
            }
        }
        pipe
    }
}

#[async_trait]
impl ScoredSetStore for RedisStore {
    async fn count_by_score(
        &self,
        key: &str,
        min: ScoreBound,
        max: ScoreBound,
    ) -> Result<u64, StoreError> {
        let redis_key = self.namespaced_key(key);
        let mut connection = self.connection();
        let count: u64 = connection
            .zcount(&redis_key, min.to_string(), max.to_string())
            .await?;

        trace!(key = %redis_key, min = %min, max = %max, count, "ZCOUNT");
        Ok(count)
    }

    async fn execute(&self, key: &str, batch: Batch) -> Result<BatchReplies, StoreError> {
        let redis_key = self.namespaced_key(key);
        let pipe = self.build_pipeline(&redis_key, &batch);
        let mut connection = self.connection();

        let values: Vec<redis::Value> = pipe.query_async(&mut connection).await?;

        if values.len() != batch.len() {
            return Err(StoreError::Command(format!(
                "expected {} pipeline replies, got {}",
                batch.len(),
                values.len()
            )));
        }

        Ok(values
            .iter()
            .map(|value| redis::from_redis_value::<u64>(value).map_err(StoreError::from))
            .collect())
    }
}
