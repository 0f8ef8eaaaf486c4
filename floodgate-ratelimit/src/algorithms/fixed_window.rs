//! Fixed window counter

use super::{AdmissionPolicy, PolicyContext, require_limit, require_window};
use crate::decision::Decision;
use crate::error::{RateLimitError, RateLimitResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Fixed window admission policy
///
/// One counter per caller, incremented on every evaluation. The counter
/// expires `window` after its first increment, which starts the next window.
/// Up to twice the limit can pass around a window boundary.
#[derive(Debug)]
pub struct FixedWindow {
    ctx: PolicyContext,
    window: Duration,
    limit: u64,
}

impl FixedWindow {
    /// Allow `limit` requests per `window`
    pub fn new(ctx: PolicyContext, window: Duration, limit: u64) -> RateLimitResult<Self> {
        require_window("window", window)?;
        require_limit("limit", limit)?;

        debug!(
            namespace = %ctx.keys.base_key(),
            window = ?window,
            limit = limit,
            "Created fixed window"
        );

        Ok(Self { ctx, window, limit })
    }

    /// Window size
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests allowed per window
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

#[async_trait]
impl AdmissionPolicy for FixedWindow {
    async fn evaluate(
        &self,
        caller: &str,
        override_limit: Option<u64>,
    ) -> RateLimitResult<Decision> {
        let key = self.ctx.keys.key(caller);
        let limit = override_limit.unwrap_or(self.limit);

        let count = self.ctx.store.increment(&key).await?;
        if count <= 0 {
            return Err(RateLimitError::malformed(
                &key,
                format!("counter incremented to {}", count),
            ));
        }
        if count == 1 {
            // First hit of the window starts its clock
            self.ctx.store.expire(&key, self.window).await?;
        }

        let decision = Decision::from_count(count as u64, limit);
        if decision.limited {
            warn!(key = %key, count = count, limit = limit, "Fixed window limit exceeded");
        } else {
            trace!(key = %key, count = count, limit = limit, "Fixed window admitted request");
        }

        Ok(decision)
    }

    async fn reset(&self, caller: &str) -> RateLimitResult<()> {
        let key = self.ctx.keys.key(caller);
        debug!(key = %key, "Resetting fixed window");
        self.ctx.store.delete(&key).await
    }

    fn name(&self) -> &'static str {
        "fixed_window"
    }
}
