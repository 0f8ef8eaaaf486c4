//! Multi-tier sliding window log
//!
//! Keeps the raw timestamps of recent events in a list, newest at the tail,
//! and checks several thresholds against them at once (e.g. 5 per minute and
//! 10 per hour). Only the newest `largest limit` entries can ever matter, so
//! the list is trimmed to that plus a small slack on each evaluation.

use super::{AdmissionPolicy, PolicyContext, require_limit};
use crate::decision::{Decision, DecisionDetail};
use crate::error::{RateLimitError, RateLimitResult};
use crate::time::{Timestamp, parse_unit};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Entries kept beyond the largest tier limit
pub const LIST_SLACK: u64 = 20;

/// Tier as configured, with its unit still a string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Name reported when this tier fires
    pub name: String,
    /// Span of the tier: `"15M"`, `"3H"`, `"2D"`, `"45"`, `"minute"`, ...
    pub unit: String,
    /// Events allowed within the span
    pub limit: u64,
}

impl TierConfig {
    /// Create a tier configuration
    pub fn new(name: impl Into<String>, unit: impl Into<String>, limit: u64) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            limit,
        }
    }
}

/// Validated tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    /// Tier name
    pub name: String,
    /// Span of the tier
    pub unit: Duration,
    /// Events allowed within the span
    pub limit: u64,
}

impl TryFrom<TierConfig> for Tier {
    type Error = RateLimitError;

    fn try_from(config: TierConfig) -> RateLimitResult<Self> {
        require_limit(&format!("tier {} limit", config.name), config.limit)?;
        Ok(Self {
            unit: parse_unit(&config.unit)?,
            name: config.name,
            limit: config.limit,
        })
    }
}

/// Multi-tier sliding window log admission policy
#[derive(Debug)]
pub struct SlidingWindowLog {
    ctx: PolicyContext,
    /// Sorted by limit, largest first
    tiers: Vec<Tier>,
    max_list_length: u64,
}

impl SlidingWindowLog {
    /// Create a log checking every tier in `tiers`
    pub fn new(ctx: PolicyContext, tiers: Vec<TierConfig>) -> RateLimitResult<Self> {
        if tiers.is_empty() {
            return Err(RateLimitError::config("at least one tier is required"));
        }

        let mut tiers = tiers
            .into_iter()
            .map(Tier::try_from)
            .collect::<RateLimitResult<Vec<_>>>()?;
        tiers.sort_by(|a, b| b.limit.cmp(&a.limit));

        let largest = tiers[0].limit;
        let max_list_length = largest.saturating_add(LIST_SLACK);

        debug!(
            namespace = %ctx.keys.base_key(),
            tiers = tiers.len(),
            max_list_length = max_list_length,
            "Created sliding window log"
        );

        Ok(Self {
            ctx,
            tiers,
            max_list_length,
        })
    }

    /// Tiers in evaluation order
    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Largest tier limit
    pub fn largest_limit(&self) -> u64 {
        self.tiers[0].limit
    }

    /// Longest the stored list is allowed to grow between evaluations
    pub fn max_list_length(&self) -> u64 {
        self.max_list_length
    }

    fn as_index(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl AdmissionPolicy for SlidingWindowLog {
    /// The tiers are the limits, so `override_limit` is ignored.
    async fn evaluate(
        &self,
        caller: &str,
        _override_limit: Option<u64>,
    ) -> RateLimitResult<Decision> {
        let key = self.ctx.keys.key(caller);
        let now = self.ctx.clock.now();

        let len = self.ctx.store.list_len(&key).await?;
        if len > self.max_list_length {
            let excess = len - self.max_list_length;
            self.ctx
                .store
                .list_trim(&key, Self::as_index(excess), -1)
                .await?;
            debug!(key = %key, trimmed = excess, "Trimmed event log");
        }

        let mut entries = self
            .ctx
            .store
            .list_range(&key, -Self::as_index(self.largest_limit()), -1)
            .await?;
        entries.reverse();

        let mut counts = vec![0u64; self.tiers.len()];
        for entry in &entries {
            let at = Timestamp::parse_stored(&key, entry)?;
            let age = now.saturating_duration_since(at);

            for (tier, count) in self.tiers.iter().zip(counts.iter_mut()) {
                if tier.unit > age {
                    *count += 1;
                    if *count >= tier.limit {
                        warn!(
                            key = %key,
                            tier = %tier.name,
                            limit = tier.limit,
                            "Sliding window log tier exceeded"
                        );
                        return Ok(Decision::limited(Some(DecisionDetail::Tier {
                            name: tier.name.clone(),
                            unit: tier.unit,
                            limit: tier.limit,
                            tripped_at: at,
                        })));
                    }
                }
            }
        }

        trace!(key = %key, entries = entries.len(), "Sliding window log admitted request");
        Ok(Decision::allowed(None))
    }

    async fn record(&self, caller: &str, at: Option<Timestamp>) -> RateLimitResult<()> {
        let key = self.ctx.keys.key(caller);
        let at = at.unwrap_or_else(|| self.ctx.clock.now());

        let len = self
            .ctx
            .store
            .list_append(&key, &at.as_millis().to_string())
            .await?;
        trace!(key = %key, at = %at, len = len, "Appended to event log");
        Ok(())
    }

    async fn reset(&self, caller: &str) -> RateLimitResult<()> {
        let key = self.ctx.keys.key(caller);
        debug!(key = %key, "Resetting sliding window log");
        self.ctx.store.delete(&key).await
    }

    fn name(&self) -> &'static str {
        "sliding_window_log"
    }
}
