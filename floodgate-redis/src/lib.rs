//! # Floodgate Redis
//!
//! Redis connection handling for Floodgate's distributed admission control.
//!
//! ## Features
//!
//! - **Connection Pooling**: bb8-managed multiplexed connections
//! - **Environment Configuration**: `REDIS_URL`, `REDIS_POOL_SIZE`, ...
//! - **Health Checks**: `PING` on pool creation and on demand
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use floodgate_redis::{RedisService, RedisConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RedisConfig::builder()
//!         .url("redis://localhost:6379")
//!         .pool_size(10)
//!         .build();
//!
//!     let redis = RedisService::new(config).await?;
//!     redis.health_check().await?;
//!
//!     let mut conn = redis.get().await?;
//!     let _: i64 = redis::cmd("INCR")
//!         .arg("visits")
//!         .query_async(&mut *conn)
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod service;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use connection::RedisConnection;
pub use service::{PoolStats, RedisPool, RedisService};

// Re-export redis crate for convenience
pub use redis;
pub use redis::AsyncCommands;
