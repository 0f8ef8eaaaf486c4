//! Rate limit storage backends
//!
//! Policies never keep authoritative state in process; everything goes
//! through the narrow [`AdmissionStore`] interface, where each method is a
//! single atomic store operation.
//!
//! - **Memory**: In-memory storage using DashMap (single instance, tests)
//! - **Redis**: Distributed storage for multi-instance deployments

mod memory;
#[cfg(feature = "redis")]
mod redis;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis::{RedisStore, WatchedUpdate};

use crate::error::RateLimitResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Store type for rate limiting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    /// In-memory store (single instance only)
    #[default]
    Memory,
    /// Redis store (distributed)
    Redis,
}

/// Atomic primitives consumed by the admission policies.
///
/// Every method must be atomic on its own. No method is expected to be
/// atomic together with any other; policies document where that matters.
/// List indices follow Redis semantics: negative values count from the tail,
/// `-1` being the last element.
#[async_trait]
pub trait AdmissionStore: Send + Sync {
    /// Increment an integer counter, creating it at 0 first. Returns the new value.
    async fn increment(&self, key: &str) -> RateLimitResult<i64>;

    /// Set a time-to-live on an existing key
    async fn expire(&self, key: &str, ttl: Duration) -> RateLimitResult<()>;

    /// Add `member` to a sorted set with `score`
    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> RateLimitResult<()>;

    /// Remove members scored in `[min, max]`. Returns how many were removed.
    async fn sorted_set_prune_by_score(&self, key: &str, min: i64, max: i64)
    -> RateLimitResult<u64>;

    /// Count members scored in `[min, max]`
    async fn sorted_set_count_by_score(&self, key: &str, min: i64, max: i64)
    -> RateLimitResult<u64>;

    /// Append to the tail of a list. Returns the new length.
    async fn list_append(&self, key: &str, value: &str) -> RateLimitResult<u64>;

    /// Length of a list, 0 when absent
    async fn list_len(&self, key: &str) -> RateLimitResult<u64>;

    /// Keep only the elements in `[start, stop]`
    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> RateLimitResult<()>;

    /// Elements in `[start, stop]`, head to tail
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> RateLimitResult<Vec<String>>;

    /// All fields of a hash, empty when absent
    async fn hash_get_all(&self, key: &str) -> RateLimitResult<HashMap<String, String>>;

    /// Set several hash fields at once
    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> RateLimitResult<()>;

    /// Delete a key of any type
    async fn delete(&self, key: &str) -> RateLimitResult<()>;

    /// Get store type name for debugging
    fn store_type(&self) -> &'static str;
}
