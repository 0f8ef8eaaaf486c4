//! Redis rate limit store
//!
//! Maps each [`AdmissionStore`] primitive onto exactly one Redis command over
//! a pooled connection from `floodgate-redis`. Requires the `redis` feature.
//!
//! [`WatchedUpdate`] additionally offers an optimistic bucket updater built
//! on `WATCH`/`MULTI`/`EXEC`.

use crate::algorithms::{BucketState, BucketStateUpdater, BucketTransition};
use crate::decision::Decision;
use crate::error::{RateLimitError, RateLimitResult};
use crate::stores::AdmissionStore;
use async_trait::async_trait;
use floodgate_redis::{AsyncCommands, RedisConfig, RedisConnection, RedisService};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Redis-backed rate limit store
///
/// Supports distributed rate limiting across multiple application instances.
pub struct RedisStore {
    service: Arc<RedisService>,
}

impl RedisStore {
    /// Connect to Redis at `url` with default pool settings
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn new(url: &str) -> RateLimitResult<Self> {
        Self::connect(RedisConfig::new(url)).await
    }

    /// Connect with a full Redis configuration
    pub async fn connect(config: RedisConfig) -> RateLimitResult<Self> {
        debug!(url = %config.url, "Connecting to Redis for rate limiting");
        let service = RedisService::new(config).await?;
        Ok(Self::from_service(Arc::new(service)))
    }

    /// Share an already-connected service
    pub fn from_service(service: Arc<RedisService>) -> Self {
        Self { service }
    }

    /// The underlying service
    pub fn service(&self) -> &Arc<RedisService> {
        &self.service
    }

    pub(crate) async fn conn(&self) -> RateLimitResult<RedisConnection<'_>> {
        Ok(self.service.get().await?)
    }
}

#[async_trait]
impl AdmissionStore for RedisStore {
    async fn increment(&self, key: &str) -> RateLimitResult<i64> {
        let mut conn = self.conn().await?;
        let count: i64 = conn.incr(key, 1).await?;
        trace!(key = %key, count = count, "Redis INCR");
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RateLimitResult<()> {
        let mut conn = self.conn().await?;
        // EXPIRE takes whole seconds; never round a sub-second TTL down to 0
        let secs = ttl.as_secs().max(1) as i64;
        let _: bool = conn.expire(key, secs).await?;
        Ok(())
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> RateLimitResult<()> {
        let mut conn = self.conn().await?;
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn sorted_set_prune_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> RateLimitResult<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.zrembyscore(key, min, max).await?;
        Ok(removed)
    }

    async fn sorted_set_count_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> RateLimitResult<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = conn.zcount(key, min, max).await?;
        Ok(count)
    }

    async fn list_append(&self, key: &str, value: &str) -> RateLimitResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.rpush(key, value).await?;
        Ok(len)
    }

    async fn list_len(&self, key: &str) -> RateLimitResult<u64> {
        let mut conn = self.conn().await?;
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> RateLimitResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.ltrim(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> RateLimitResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let items: Vec<String> = conn.lrange(key, start as isize, stop as isize).await?;
        Ok(items)
    }

    async fn hash_get_all(&self, key: &str) -> RateLimitResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> RateLimitResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> RateLimitResult<()> {
        debug!(key = %key, "Resetting rate limit state in Redis");
        let mut conn = self.conn().await?;
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("service", &self.service)
            .finish()
    }
}

/// Bucket updater using Redis optimistic transactions.
///
/// The bucket key is `WATCH`ed before it is read and the write is sent as
/// `MULTI`/`HSET`/`EXEC`. If another client modified the key in between, the
/// transaction is discarded and [`RateLimitError::Conflict`] is returned.
/// There is no retry.
#[derive(Debug, Clone)]
pub struct WatchedUpdate {
    store: Arc<RedisStore>,
}

impl WatchedUpdate {
    /// Update bucket state through `store`
    pub fn new(store: Arc<RedisStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BucketStateUpdater for WatchedUpdate {
    async fn check_and_update(
        &self,
        key: &str,
        transition: &BucketTransition,
    ) -> RateLimitResult<Decision> {
        let mut conn = self.store.conn().await?;
        conn.watch(key).await?;

        let fields: HashMap<String, String> = match conn.hgetall(key).await {
            Ok(fields) => fields,
            Err(err) => {
                conn.unwatch().await?;
                return Err(RateLimitError::from(err));
            }
        };
        let current = match BucketState::from_fields(key, &fields) {
            Ok(current) => current,
            Err(err) => {
                conn.unwatch().await?;
                return Err(err);
            }
        };

        let outcome = transition(current);
        let Some(state) = outcome.write else {
            conn.unwatch().await?;
            return Ok(outcome.decision);
        };

        let mut pipe = floodgate_redis::redis::pipe();
        pipe.atomic()
            .hset_multiple(key, &state.to_fields())
            .ignore()
            .hlen(key);
        let committed: Option<(u64,)> = conn.exec_watched(&pipe).await?;

        match committed {
            Some(_) => {
                trace!(key = %key, tokens = state.tokens, "Committed watched bucket update");
                Ok(outcome.decision)
            }
            None => {
                warn!(key = %key, "Bucket state changed during watched update");
                Err(RateLimitError::Conflict(key.to_string()))
            }
        }
    }

    async fn load(&self, key: &str) -> RateLimitResult<Option<BucketState>> {
        let fields = self.store.hash_get_all(key).await?;
        BucketState::from_fields(key, &fields)
    }
}
