//! # Floodgate Rate Limiting
//!
//! Store-backed admission control: decide whether a caller may proceed right
//! now, with all durable state kept in a shared store so any number of
//! application instances enforce one limit together.
//!
//! ## Features
//!
//! - **Five Algorithms**: Fixed window, sliding window counter, multi-tier
//!   sliding window log, token bucket and leaky bucket
//! - **Storage Backends**: In-memory (DashMap) and Redis for distributed deployments
//! - **Namespaced Keys**: `{prefix}-{app}-{func}-{caller}`
//! - **Pluggable Bucket Updates**: Plain read-then-write, per-key local lock,
//!   or Redis optimistic transactions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use floodgate_ratelimit::{Algorithm, RateLimiter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Create a rate limiter with token bucket algorithm
//! let limiter = RateLimiter::builder()
//!     .algorithm(Algorithm::TokenBucket {
//!         max_tokens: 100,
//!         refill_rate: 10.0,
//!     })
//!     .app_name("api")
//!     .func_name("search")
//!     .build()
//!     .await?;
//!
//! let decision = limiter.evaluate("user_123").await?;
//! if decision.limited {
//!     println!("Rate limited: {:?}", decision.detail);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Algorithms
//!
//! ### Fixed Window
//!
//! One expiring counter per caller. Cheapest; allows bursts at window edges.
//!
//! ```rust
//! use floodgate_ratelimit::Algorithm;
//! use std::time::Duration;
//!
//! let algo = Algorithm::FixedWindow {
//!     window: Duration::from_secs(60),
//!     limit: 100,
//! };
//! ```
//!
//! ### Sliding Window Counter
//!
//! Counts recorded events in the trailing window. Events are ingested with
//! [`RateLimiter::record`], evaluation only counts.
//!
//! ### Sliding Window Log
//!
//! Several thresholds over one event log:
//!
//! ```rust
//! use floodgate_ratelimit::{Algorithm, TierConfig};
//!
//! let algo = Algorithm::SlidingWindowLog {
//!     tiers: vec![
//!         TierConfig::new("burst", "1M", 5),
//!         TierConfig::new("hourly", "1H", 100),
//!     ],
//! };
//! ```
//!
//! ### Token Bucket and Leaky Bucket
//!
//! Token bucket starts full and refills; leaky bucket starts empty and drains.
//! Both keep `{tokens, updated_at}` per caller.
//!
//! ## Failures
//!
//! Being limited is a normal [`Decision`]. Store outages and malformed state
//! are [`RateLimitError`]s; whether to fail open or closed is up to the caller.

pub mod algorithms;
pub mod config;
pub mod decision;
pub mod error;
pub mod key;
pub mod stores;
pub mod time;

pub use algorithms::{
    AdmissionPolicy, Algorithm, BucketState, BucketStateUpdater, FixedWindow, LeakyBucket,
    LocalKeyLock, PolicyContext, ReadThenWrite, SlidingWindow, SlidingWindowLog, TierConfig,
    TokenBucket,
};
pub use config::{RateLimitConfig, RateLimiterBuilder, UpdateStrategy};
pub use decision::{Decision, DecisionDetail};
pub use error::{RateLimitError, RateLimitResult};
pub use key::KeyBuilder;
pub use stores::{AdmissionStore, MemoryStore, StoreType};
pub use time::{Clock, ManualClock, SystemClock, Timestamp, convert_unit_to_seconds, parse_unit};

#[cfg(feature = "redis")]
pub use stores::{RedisStore, WatchedUpdate};

use std::sync::Arc;
use tracing::debug;

/// Rate limiter
///
/// One configured policy plus the configuration it was built from.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    policy: Arc<dyn AdmissionPolicy>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Create a new rate limiter builder
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// Create a rate limiter around an already-built policy
    pub fn new(policy: Arc<dyn AdmissionPolicy>, config: RateLimitConfig) -> Self {
        debug!(
            algorithm = policy.name(),
            namespace = %config.key_builder().base_key(),
            "Rate limiter ready"
        );
        Self { policy, config }
    }

    /// Decide whether `caller` may proceed now
    pub async fn evaluate(&self, caller: &str) -> RateLimitResult<Decision> {
        self.policy.evaluate(caller, None).await
    }

    /// Decide with a one-off limit (or capacity) in place of the configured one
    pub async fn evaluate_with_limit(&self, caller: &str, limit: u64) -> RateLimitResult<Decision> {
        self.policy.evaluate(caller, Some(limit)).await
    }

    /// Record one event for `caller` now
    pub async fn record(&self, caller: &str) -> RateLimitResult<()> {
        self.policy.record(caller, None).await
    }

    /// Record one event for `caller` at `at`
    pub async fn record_at(&self, caller: &str, at: Timestamp) -> RateLimitResult<()> {
        self.policy.record(caller, Some(at)).await
    }

    /// Reset rate limit for a key
    pub async fn reset(&self, caller: &str) -> RateLimitResult<()> {
        self.policy.reset(caller).await
    }

    /// The underlying policy
    pub fn policy(&self) -> &Arc<dyn AdmissionPolicy> {
        &self.policy
    }

    /// Get the algorithm
    pub fn algorithm(&self) -> &Algorithm {
        &self.config.algorithm
    }

    /// Get the configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
