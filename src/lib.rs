// Floodgate - distributed admission control for Rust
//
// This library decides whether a caller may proceed right now, using one of
// five rate limiting algorithms with all state kept in a shared store.

// Re-export core functionality
pub use floodgate_ratelimit::*;

// Re-export optional crates
#[cfg(feature = "redis")]
pub use floodgate_redis;

/// Prelude for common imports.
///
/// ```
/// use floodgate::prelude::*;
/// ```
pub mod prelude {
    pub use floodgate_ratelimit::{
        AdmissionPolicy, AdmissionStore, Algorithm, Clock, Decision, DecisionDetail, MemoryStore,
        RateLimitConfig, RateLimitError, RateLimitResult, RateLimiter, TierConfig, Timestamp,
        UpdateStrategy,
    };

    #[cfg(feature = "redis")]
    pub use floodgate_ratelimit::{RedisStore, WatchedUpdate};

    #[cfg(feature = "redis")]
    pub use floodgate_redis::{RedisConfig, RedisService};
}
