//! Sliding window counter
//!
//! Events are recorded as sorted-set members scored by their timestamp
//! relative to a fixed epoch. Evaluation prunes everything older than the
//! retention horizon and counts what falls inside the trailing window.

use super::{AdmissionPolicy, PolicyContext, require_limit, require_window};
use crate::decision::Decision;
use crate::error::{RateLimitError, RateLimitResult};
use crate::time::Timestamp;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Default sorted-set score origin (2023-07-22T04:26:40Z)
pub const DEFAULT_EPOCH: Timestamp = Timestamp::from_millis(1_690_000_000_000);

/// Default retention beyond the evaluation window
pub const DEFAULT_RETENTION_MARGIN: Duration = Duration::from_secs(60);

/// Sliding window counter admission policy
///
/// Unlike the other policies, evaluation does not count the request; callers
/// ingest events with [`AdmissionPolicy::record`].
#[derive(Debug)]
pub struct SlidingWindow {
    ctx: PolicyContext,
    window: Duration,
    limit: u64,
    retention_margin: Duration,
    epoch: Timestamp,
}

impl SlidingWindow {
    /// Allow `limit` events in any trailing `window`
    pub fn new(ctx: PolicyContext, window: Duration, limit: u64) -> RateLimitResult<Self> {
        require_window("window", window)?;
        require_limit("limit", limit)?;

        debug!(
            namespace = %ctx.keys.base_key(),
            window = ?window,
            limit = limit,
            "Created sliding window"
        );

        Ok(Self {
            ctx,
            window,
            limit,
            retention_margin: DEFAULT_RETENTION_MARGIN,
            epoch: DEFAULT_EPOCH,
        })
    }

    /// Keep events for `margin` past the window before pruning them
    pub fn with_retention_margin(mut self, margin: Duration) -> RateLimitResult<Self> {
        if margin.is_zero() {
            return Err(RateLimitError::config(
                "retention_margin must be greater than 0",
            ));
        }
        self.retention_margin = margin;
        Ok(self)
    }

    /// Score events relative to `epoch`
    pub fn with_epoch(mut self, epoch: Timestamp) -> Self {
        self.epoch = epoch;
        self
    }

    /// Window size
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Total time an event is kept
    pub fn retention(&self) -> Duration {
        self.window.saturating_add(self.retention_margin)
    }

    fn member(at: Timestamp) -> String {
        format!("{}-{}", at.as_millis(), Uuid::new_v4())
    }
}

#[async_trait]
impl AdmissionPolicy for SlidingWindow {
    async fn evaluate(
        &self,
        caller: &str,
        override_limit: Option<u64>,
    ) -> RateLimitResult<Decision> {
        let key = self.ctx.keys.key(caller);
        let limit = override_limit.unwrap_or(self.limit);
        let now = self.ctx.clock.now();

        let cutoff = now.saturating_sub(self.retention()).offset_from(self.epoch);
        let pruned = self
            .ctx
            .store
            .sorted_set_prune_by_score(&key, 0, cutoff)
            .await?;
        if pruned > 0 {
            debug!(key = %key, pruned = pruned, "Pruned expired events");
        }

        let count = self
            .ctx
            .store
            .sorted_set_count_by_score(
                &key,
                now.saturating_sub(self.window).offset_from(self.epoch),
                now.offset_from(self.epoch),
            )
            .await?;

        let decision = Decision::from_count(count, limit);
        if decision.limited {
            warn!(key = %key, count = count, limit = limit, "Sliding window limit exceeded");
        } else {
            trace!(key = %key, count = count, limit = limit, "Sliding window admitted request");
        }

        Ok(decision)
    }

    async fn record(&self, caller: &str, at: Option<Timestamp>) -> RateLimitResult<()> {
        let key = self.ctx.keys.key(caller);
        let at = at.unwrap_or_else(|| self.ctx.clock.now());

        self.ctx
            .store
            .sorted_set_add(&key, at.offset_from(self.epoch), &Self::member(at))
            .await?;
        trace!(key = %key, at = %at, "Recorded event");
        Ok(())
    }

    async fn reset(&self, caller: &str) -> RateLimitResult<()> {
        let key = self.ctx.keys.key(caller);
        debug!(key = %key, "Resetting sliding window");
        self.ctx.store.delete(&key).await
    }

    fn name(&self) -> &'static str {
        "sliding_window"
    }
}
