//! Rate limiting algorithms
//!
//! Five independent admission policies share one contract,
//! [`AdmissionPolicy`]:
//!
//! - **Fixed Window**: one atomic counter per window
//! - **Sliding Window**: timestamped events in a sorted set, counted over a trailing range
//! - **Sliding Window Log**: raw timestamps checked against several tiers at once
//! - **Token Bucket**: stored tokens replenished with elapsed time
//! - **Leaky Bucket**: stored fill level drained with elapsed time
//!
//! None of them keeps state in process. Each evaluation is a bounded number
//! of store round-trips with no retry loop.

mod bucket;
mod fixed_window;
mod leaky_bucket;
mod sliding_log;
mod sliding_window;
mod token_bucket;

pub use bucket::{
    BucketOutcome, BucketState, BucketStateUpdater, BucketTransition, LocalKeyLock, ReadThenWrite,
};
pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_log::{LIST_SLACK, SlidingWindowLog, Tier, TierConfig};
pub use sliding_window::{DEFAULT_EPOCH, DEFAULT_RETENTION_MARGIN, SlidingWindow};
pub use token_bucket::TokenBucket;

use crate::decision::Decision;
use crate::error::{RateLimitError, RateLimitResult};
use crate::key::KeyBuilder;
use crate::stores::AdmissionStore;
use crate::time::{Clock, SystemClock, Timestamp, duration_secs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Trait implemented by every admission policy
#[async_trait]
pub trait AdmissionPolicy: Send + Sync + fmt::Debug {
    /// Decide whether `key` may proceed now.
    ///
    /// `override_limit` replaces the configured limit (or capacity) for this
    /// call only. Being over the limit is an `Ok` decision, never an error.
    async fn evaluate(&self, key: &str, override_limit: Option<u64>) -> RateLimitResult<Decision>;

    /// Ingest one event for `key` at `at` (default: now).
    ///
    /// Only the sliding window variants separate ingestion from evaluation;
    /// for the others evaluation itself counts and this does nothing.
    async fn record(&self, key: &str, at: Option<Timestamp>) -> RateLimitResult<()> {
        let _ = (key, at);
        Ok(())
    }

    /// Remove all stored state for `key`
    async fn reset(&self, key: &str) -> RateLimitResult<()>;

    /// Short algorithm name for logs
    fn name(&self) -> &'static str;
}

/// Everything a policy needs besides its own limits
#[derive(Clone)]
pub struct PolicyContext {
    /// Shared store holding all state
    pub store: Arc<dyn AdmissionStore>,
    /// Namespace for this policy's keys
    pub keys: KeyBuilder,
    /// Time source
    pub clock: Arc<dyn Clock>,
}

impl PolicyContext {
    /// Context on the system clock
    pub fn new(store: Arc<dyn AdmissionStore>, keys: KeyBuilder) -> Self {
        Self {
            store,
            keys,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl fmt::Debug for PolicyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyContext")
            .field("store", &self.store.store_type())
            .field("keys", &self.keys)
            .field("clock", &self.clock)
            .finish()
    }
}

fn default_retention_margin() -> Duration {
    sliding_window::DEFAULT_RETENTION_MARGIN
}

fn default_epoch() -> Timestamp {
    sliding_window::DEFAULT_EPOCH
}

/// Rate limiting algorithm configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Algorithm {
    /// Fixed window algorithm
    ///
    /// Counts requests per window with one expiring counter.
    /// Simple but can allow bursts at window boundaries.
    FixedWindow {
        /// Window duration
        #[serde(with = "duration_secs")]
        window: Duration,
        /// Maximum requests allowed per window
        limit: u64,
    },

    /// Sliding window counter
    ///
    /// Counts recorded events in the trailing window.
    SlidingWindow {
        /// Window duration
        #[serde(with = "duration_secs")]
        window: Duration,
        /// Maximum events allowed in the window
        limit: u64,
        /// Extra retention beyond the window, used only to bound storage
        #[serde(with = "duration_secs", default = "default_retention_margin")]
        retention_margin: Duration,
        /// Origin subtracted from timestamps to form sorted-set scores
        #[serde(default = "default_epoch")]
        epoch: Timestamp,
    },

    /// Multi-tier sliding window log
    ///
    /// Tracks raw timestamps and checks several thresholds at once,
    /// e.g. per minute and per hour.
    SlidingWindowLog {
        /// Tier definitions, in any order
        tiers: Vec<TierConfig>,
    },

    /// Token bucket algorithm
    ///
    /// Starts full; each request takes a token, tokens come back over time.
    TokenBucket {
        /// Maximum number of tokens (burst capacity)
        max_tokens: u64,
        /// Tokens added per second
        refill_rate: f64,
    },

    /// Leaky bucket algorithm
    ///
    /// Starts empty; each request adds to the level, which drains over time.
    LeakyBucket {
        /// Maximum fill level
        capacity: u64,
        /// Tokens drained per second
        leak_rate: f64,
    },
}

impl Algorithm {
    /// Fixed window with default values (10 requests per 10 seconds)
    pub fn fixed_window_default() -> Self {
        Self::FixedWindow {
            window: Duration::from_secs(10),
            limit: 10,
        }
    }

    /// Sliding window with default values (10 events per 10 seconds)
    pub fn sliding_window_default() -> Self {
        Self::SlidingWindow {
            window: Duration::from_secs(10),
            limit: 10,
            retention_margin: default_retention_margin(),
            epoch: default_epoch(),
        }
    }

    /// Token bucket with default values (100 tokens, 10/sec refill)
    pub fn token_bucket_default() -> Self {
        Self::TokenBucket {
            max_tokens: 100,
            refill_rate: 10.0,
        }
    }

    /// Leaky bucket with default values (100 capacity, 10/sec leak)
    pub fn leaky_bucket_default() -> Self {
        Self::LeakyBucket {
            capacity: 100,
            leak_rate: 10.0,
        }
    }

    /// Get the effective limit for this algorithm
    ///
    /// For the multi-tier log this is the largest tier limit.
    pub fn limit(&self) -> u64 {
        match self {
            Algorithm::FixedWindow { limit, .. } => *limit,
            Algorithm::SlidingWindow { limit, .. } => *limit,
            Algorithm::SlidingWindowLog { tiers } => {
                tiers.iter().map(|t| t.limit).max().unwrap_or(0)
            }
            Algorithm::TokenBucket { max_tokens, .. } => *max_tokens,
            Algorithm::LeakyBucket { capacity, .. } => *capacity,
        }
    }

    /// Get a human-readable description of the algorithm
    pub fn description(&self) -> String {
        match self {
            Algorithm::FixedWindow { window, limit } => {
                format!("Fixed window: {} requests per {:?}", limit, window)
            }
            Algorithm::SlidingWindow { window, limit, .. } => {
                format!("Sliding window: {} events per {:?}", limit, window)
            }
            Algorithm::SlidingWindowLog { tiers } => {
                let tiers: Vec<String> = tiers
                    .iter()
                    .map(|t| format!("{} {} per {}", t.name, t.limit, t.unit))
                    .collect();
                format!("Sliding window log: {}", tiers.join(", "))
            }
            Algorithm::TokenBucket {
                max_tokens,
                refill_rate,
            } => format!(
                "Token bucket: {} tokens, {:.2} tokens/sec refill",
                max_tokens, refill_rate
            ),
            Algorithm::LeakyBucket {
                capacity,
                leak_rate,
            } => format!(
                "Leaky bucket: {} capacity, {:.2} tokens/sec leak",
                capacity, leak_rate
            ),
        }
    }

    /// Construct the policy this configuration describes
    ///
    /// `updater` is used by the bucket algorithms only; `None` means plain
    /// read-then-write against the context's store.
    pub fn build(
        &self,
        ctx: PolicyContext,
        updater: Option<Arc<dyn BucketStateUpdater>>,
    ) -> RateLimitResult<Arc<dyn AdmissionPolicy>> {
        let policy: Arc<dyn AdmissionPolicy> = match self {
            Algorithm::FixedWindow { window, limit } => {
                Arc::new(FixedWindow::new(ctx, *window, *limit)?)
            }
            Algorithm::SlidingWindow {
                window,
                limit,
                retention_margin,
                epoch,
            } => Arc::new(
                SlidingWindow::new(ctx, *window, *limit)?
                    .with_retention_margin(*retention_margin)?
                    .with_epoch(*epoch),
            ),
            Algorithm::SlidingWindowLog { tiers } => {
                Arc::new(SlidingWindowLog::new(ctx, tiers.clone())?)
            }
            Algorithm::TokenBucket {
                max_tokens,
                refill_rate,
            } => {
                let bucket = TokenBucket::new(ctx, *max_tokens, *refill_rate)?;
                match updater {
                    Some(updater) => Arc::new(bucket.with_updater(updater)),
                    None => Arc::new(bucket),
                }
            }
            Algorithm::LeakyBucket {
                capacity,
                leak_rate,
            } => {
                let bucket = LeakyBucket::new(ctx, *capacity, *leak_rate)?;
                match updater {
                    Some(updater) => Arc::new(bucket.with_updater(updater)),
                    None => Arc::new(bucket),
                }
            }
        };
        Ok(policy)
    }
}

pub(crate) fn require_limit(name: &str, value: u64) -> RateLimitResult<()> {
    if value == 0 {
        return Err(RateLimitError::config(format!(
            "{} must be greater than 0",
            name
        )));
    }
    Ok(())
}

pub(crate) fn require_window(name: &str, value: Duration) -> RateLimitResult<()> {
    if value.is_zero() {
        return Err(RateLimitError::config(format!("{} must be non-zero", name)));
    }
    Ok(())
}

pub(crate) fn require_rate(name: &str, value: f64) -> RateLimitResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(RateLimitError::config(format!(
            "{} must be greater than 0",
            name
        )));
    }
    Ok(())
}
