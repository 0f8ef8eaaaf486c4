//! Shared Redis handle and its connection pool.

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use tracing::info;

use crate::{RedisConfig, RedisConnection, RedisError, Result};

/// bb8 pool of multiplexed Redis connections.
pub type RedisPool = Pool<RedisConnectionManager>;

/// Validate `config`, build the pool and `PING` through it once.
async fn connect_pool(config: &RedisConfig) -> Result<RedisPool> {
    config.validate()?;

    let manager = RedisConnectionManager::new(config.connection_url())
        .map_err(|e| RedisError::Connection(e.to_string()))?;
    let pool = Pool::builder()
        .max_size(config.pool_size)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .build(manager)
        .await
        .map_err(|e| RedisError::Pool(e.to_string()))?;

    ping(&mut RedisConnection::new(pool.get().await?)).await?;

    info!(
        pool_size = config.pool_size,
        url = %config.url,
        "Redis connection pool created"
    );
    Ok(pool)
}

async fn ping(conn: &mut RedisConnection<'_>) -> Result<()> {
    let _: String = redis::cmd("PING")
        .query_async(&mut **conn)
        .await
        .map_err(|e| RedisError::Connection(e.to_string()))?;
    Ok(())
}

/// Redis service owning the connection pool.
///
/// Cloning a `RedisService` is not supported; share it behind an `Arc`.
pub struct RedisService {
    config: RedisConfig,
    pool: RedisPool,
}

impl RedisService {
    /// Create a new Redis service, connecting eagerly.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = connect_pool(&config).await?;
        Ok(Self { config, pool })
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        Self { config, pool }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    /// Get a connection from the pool.
    pub async fn get(&self) -> Result<RedisConnection<'_>> {
        let conn = self.pool.get().await?;
        Ok(RedisConnection::new(conn))
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        ping(&mut self.get().await?).await
    }

    /// Get pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

impl std::fmt::Debug for RedisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisService")
            .field("url", &self.config.url)
            .field("pool_size", &self.config.pool_size)
            .finish()
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Total connections.
    pub connections: u32,
    /// Idle connections.
    pub idle_connections: u32,
}
