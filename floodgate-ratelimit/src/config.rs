//! Rate limiter configuration and builder

use crate::RateLimiter;
use crate::algorithms::{Algorithm, BucketStateUpdater, LocalKeyLock, PolicyContext, TierConfig};
use crate::error::{RateLimitError, RateLimitResult};
use crate::key::KeyBuilder;
use crate::stores::{AdmissionStore, MemoryStore, StoreType};
use crate::time::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "redis")]
use crate::stores::{RedisStore, WatchedUpdate};
#[cfg(feature = "redis")]
use floodgate_redis::RedisService;

/// How bucket state is read, recomputed and written back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStrategy {
    /// Plain read then write; concurrent evaluations of one key may race
    #[default]
    ReadThenWrite,
    /// Serialize evaluations of one key within this process
    LocalLock,
    /// Redis `WATCH`/`MULTI`/`EXEC`; lost races surface as conflicts
    Watched,
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_name() -> String {
    "default".to_string()
}

/// Configuration for the rate limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Algorithm to use
    pub algorithm: Algorithm,
    /// Store type (memory, redis)
    #[serde(default)]
    pub store_type: StoreType,
    /// Key prefix for storage
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Application namespace
    #[serde(default = "default_name")]
    pub app_name: String,
    /// Guarded operation namespace
    #[serde(default = "default_name")]
    pub func_name: String,
    /// Bucket state update strategy
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::token_bucket_default(),
            store_type: StoreType::Memory,
            key_prefix: default_key_prefix(),
            app_name: default_name(),
            func_name: default_name(),
            update_strategy: UpdateStrategy::ReadThenWrite,
        }
    }
}

impl RateLimitConfig {
    /// Create a new configuration builder
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Builder seeded from environment variables
    ///
    /// Reads `FLOODGATE_KEY_PREFIX`, `FLOODGATE_APP_NAME` and
    /// `FLOODGATE_FUNC_NAME`. With the `redis` feature, `REDIS_URL` selects
    /// the Redis store.
    pub fn from_env() -> RateLimiterBuilder {
        let mut builder = RateLimiterBuilder::new();

        if let Ok(prefix) = std::env::var("FLOODGATE_KEY_PREFIX") {
            builder = builder.key_prefix(prefix);
        }

        if let Ok(app_name) = std::env::var("FLOODGATE_APP_NAME") {
            builder = builder.app_name(app_name);
        }

        if let Ok(func_name) = std::env::var("FLOODGATE_FUNC_NAME") {
            builder = builder.func_name(func_name);
        }

        #[cfg(feature = "redis")]
        if let Ok(url) = std::env::var("REDIS_URL") {
            builder = builder.redis_store(&url);
        }

        builder
    }

    /// Key builder for this configuration's namespace
    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder::new(&self.key_prefix, &self.app_name, &self.func_name)
    }
}

/// Builder for creating a RateLimiter
pub struct RateLimiterBuilder {
    config: RateLimitConfig,
    algorithm_set: bool,
    store: Option<Arc<dyn AdmissionStore>>,
    clock: Option<Arc<dyn Clock>>,
    #[cfg(feature = "redis")]
    redis_url: Option<String>,
    #[cfg(feature = "redis")]
    redis_service: Option<Arc<RedisService>>,
}

impl RateLimiterBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: RateLimitConfig::default(),
            algorithm_set: false,
            store: None,
            clock: None,
            #[cfg(feature = "redis")]
            redis_url: None,
            #[cfg(feature = "redis")]
            redis_service: None,
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            algorithm_set: true,
            ..Self::new()
        }
    }

    /// Set the rate limiting algorithm
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.config.algorithm = algorithm;
        self.algorithm_set = true;
        self
    }

    /// Use fixed window algorithm
    pub fn fixed_window(self, limit: u64, window: Duration) -> Self {
        self.algorithm(Algorithm::FixedWindow { window, limit })
    }

    /// Use sliding window counter algorithm with default retention
    pub fn sliding_window(self, limit: u64, window: Duration) -> Self {
        self.algorithm(Algorithm::SlidingWindow {
            window,
            limit,
            retention_margin: crate::algorithms::DEFAULT_RETENTION_MARGIN,
            epoch: crate::algorithms::DEFAULT_EPOCH,
        })
    }

    /// Use multi-tier sliding window log algorithm
    pub fn sliding_window_log(self, tiers: impl IntoIterator<Item = TierConfig>) -> Self {
        self.algorithm(Algorithm::SlidingWindowLog {
            tiers: tiers.into_iter().collect(),
        })
    }

    /// Use token bucket algorithm
    pub fn token_bucket(self, max_tokens: u64, refill_rate: f64) -> Self {
        self.algorithm(Algorithm::TokenBucket {
            max_tokens,
            refill_rate,
        })
    }

    /// Use leaky bucket algorithm
    pub fn leaky_bucket(self, capacity: u64, leak_rate: f64) -> Self {
        self.algorithm(Algorithm::LeakyBucket {
            capacity,
            leak_rate,
        })
    }

    /// Use in-memory store (default)
    pub fn memory_store(mut self) -> Self {
        self.config.store_type = StoreType::Memory;
        self
    }

    /// Use Redis store for distributed rate limiting
    #[cfg(feature = "redis")]
    pub fn redis_store(mut self, url: &str) -> Self {
        self.config.store_type = StoreType::Redis;
        self.redis_url = Some(url.to_string());
        self
    }

    /// Use Redis through an already-connected service
    #[cfg(feature = "redis")]
    pub fn redis_service(mut self, service: Arc<RedisService>) -> Self {
        self.config.store_type = StoreType::Redis;
        self.redis_service = Some(service);
        self
    }

    /// Use a caller-supplied store, overriding the store type
    pub fn store(mut self, store: Arc<dyn AdmissionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a different time source
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the key prefix for storage
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Set the application namespace
    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.config.app_name = app_name.into();
        self
    }

    /// Set the guarded operation namespace
    pub fn func_name(mut self, func_name: impl Into<String>) -> Self {
        self.config.func_name = func_name.into();
        self
    }

    /// Set the bucket update strategy
    pub fn update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.config.update_strategy = strategy;
        self
    }

    /// Build the rate limiter
    pub async fn build(self) -> RateLimitResult<RateLimiter> {
        if !self.algorithm_set {
            return Err(RateLimitError::config("Algorithm must be specified"));
        }

        let config = self.config;
        debug!(
            algorithm = %config.algorithm.description(),
            store_type = ?config.store_type,
            update_strategy = ?config.update_strategy,
            "Building rate limiter"
        );

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        #[cfg(feature = "redis")]
        let mut redis_store: Option<Arc<RedisStore>> = None;

        let store: Arc<dyn AdmissionStore> = match (self.store, &config.store_type) {
            (Some(store), _) => store,
            (None, StoreType::Memory) => Arc::new(MemoryStore::with_clock(clock.clone())),
            #[cfg(feature = "redis")]
            (None, StoreType::Redis) => {
                let store = match (self.redis_service, self.redis_url) {
                    (Some(service), _) => RedisStore::from_service(service),
                    (None, Some(url)) => RedisStore::new(&url).await?,
                    (None, None) => {
                        return Err(RateLimitError::config(
                            "Redis URL must be specified for Redis store",
                        ));
                    }
                };
                let store = Arc::new(store);
                redis_store = Some(store.clone());
                store
            }
            #[cfg(not(feature = "redis"))]
            (None, StoreType::Redis) => {
                return Err(RateLimitError::config(
                    "Redis feature is not enabled. Add `redis` feature to use Redis store.",
                ));
            }
        };

        let updater: Option<Arc<dyn BucketStateUpdater>> = match config.update_strategy {
            UpdateStrategy::ReadThenWrite => None,
            UpdateStrategy::LocalLock => Some(Arc::new(LocalKeyLock::new(store.clone()))),
            #[cfg(feature = "redis")]
            UpdateStrategy::Watched => match redis_store {
                Some(redis_store) => Some(Arc::new(WatchedUpdate::new(redis_store))),
                None => {
                    return Err(RateLimitError::config(
                        "Watched updates require the Redis store",
                    ));
                }
            },
            #[cfg(not(feature = "redis"))]
            UpdateStrategy::Watched => {
                return Err(RateLimitError::config(
                    "Redis feature is not enabled. Add `redis` feature to use watched updates.",
                ));
            }
        };

        let ctx = PolicyContext::new(store, config.key_builder()).with_clock(clock);
        let policy = config.algorithm.build(ctx, updater)?;

        Ok(RateLimiter::new(policy, config))
    }
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}
