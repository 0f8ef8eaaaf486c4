//! Leaky bucket
//!
//! A bucket starts empty. Every admitted request adds one token and the level
//! drains at `leak_rate` tokens per second. Requests arriving while the bucket
//! is at capacity are limited.

use super::bucket::{BucketOutcome, BucketState, BucketStateUpdater, ReadThenWrite};
use super::token_bucket::accrued;
use super::{AdmissionPolicy, PolicyContext, require_limit, require_rate};
use crate::decision::{Decision, DecisionDetail};
use crate::error::RateLimitResult;
use crate::time::Timestamp;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Leaky bucket admission policy
#[derive(Debug)]
pub struct LeakyBucket {
    ctx: PolicyContext,
    capacity: u64,
    leak_rate: f64,
    updater: Arc<dyn BucketStateUpdater>,
}

impl LeakyBucket {
    /// Create a leaky bucket of `capacity` draining `leak_rate` tokens per
    /// second
    pub fn new(ctx: PolicyContext, capacity: u64, leak_rate: f64) -> RateLimitResult<Self> {
        require_limit("capacity", capacity)?;
        require_rate("leak_rate", leak_rate)?;

        let updater = Arc::new(ReadThenWrite::new(ctx.store.clone()));
        debug!(
            namespace = %ctx.keys.base_key(),
            capacity = capacity,
            leak_rate = leak_rate,
            "Created leaky bucket"
        );

        Ok(Self {
            ctx,
            capacity,
            leak_rate,
            updater,
        })
    }

    /// Use a different read-compute-write strategy
    pub fn with_updater(mut self, updater: Arc<dyn BucketStateUpdater>) -> Self {
        self.updater = updater;
        self
    }

    /// Bucket capacity
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Leak rate in tokens per second
    pub fn leak_rate(&self) -> f64 {
        self.leak_rate
    }

    /// Stored state for `caller`, if any
    pub async fn state(&self, caller: &str) -> RateLimitResult<Option<BucketState>> {
        self.updater.load(&self.ctx.keys.key(caller)).await
    }
}

/// Drain by elapsed time, then try to add one token.
///
/// `updated_at` moves to `now` and the drained level is written back whether
/// or not the request fits.
fn add_token(
    current: Option<BucketState>,
    now: Timestamp,
    capacity: u64,
    leak_rate: f64,
) -> BucketOutcome {
    let state = current.unwrap_or(BucketState::new(0, now));
    let leaked = accrued(now.saturating_duration_since(state.updated_at), leak_rate);
    let tokens = state.tokens.saturating_sub(leaked).min(capacity);

    if tokens < capacity {
        let next = BucketState::new(tokens + 1, now);
        BucketOutcome {
            write: Some(next),
            decision: Decision::allowed(Some(DecisionDetail::Bucket {
                tokens: next.tokens,
                capacity,
            })),
        }
    } else {
        BucketOutcome {
            write: Some(BucketState::new(tokens, now)),
            decision: Decision::limited(Some(DecisionDetail::Bucket { tokens, capacity })),
        }
    }
}

#[async_trait]
impl AdmissionPolicy for LeakyBucket {
    async fn evaluate(
        &self,
        caller: &str,
        override_limit: Option<u64>,
    ) -> RateLimitResult<Decision> {
        let key = self.ctx.keys.key(caller);
        let now = self.ctx.clock.now();
        let capacity = override_limit.unwrap_or(self.capacity);
        let leak_rate = self.leak_rate;

        let decision = self
            .updater
            .check_and_update(&key, &move |current| {
                add_token(current, now, capacity, leak_rate)
            })
            .await?;

        if decision.limited {
            warn!(key = %key, capacity = capacity, "Leaky bucket full");
        } else {
            trace!(key = %key, detail = ?decision.detail, "Leaky bucket admitted request");
        }

        Ok(decision)
    }

    async fn reset(&self, caller: &str) -> RateLimitResult<()> {
        let key = self.ctx.keys.key(caller);
        debug!(key = %key, "Resetting leaky bucket");
        self.ctx.store.delete(&key).await
    }

    fn name(&self) -> &'static str {
        "leaky_bucket"
    }
}
