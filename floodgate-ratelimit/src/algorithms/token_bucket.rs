//! Token bucket
//!
//! A bucket starts full. Every admitted request takes one token and tokens
//! flow back at `refill_rate` per second, up to `max_tokens`. Refill is lazy:
//! it is computed from the time elapsed since the last update whenever the
//! bucket is evaluated.

use super::bucket::{BucketOutcome, BucketState, BucketStateUpdater, ReadThenWrite};
use super::{AdmissionPolicy, PolicyContext, require_limit, require_rate};
use crate::decision::{Decision, DecisionDetail};
use crate::error::RateLimitResult;
use crate::time::Timestamp;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Token bucket admission policy
#[derive(Debug)]
pub struct TokenBucket {
    ctx: PolicyContext,
    max_tokens: u64,
    refill_rate: f64,
    updater: Arc<dyn BucketStateUpdater>,
}

impl TokenBucket {
    /// Create a token bucket holding at most `max_tokens`, refilled at
    /// `refill_rate` tokens per second
    pub fn new(ctx: PolicyContext, max_tokens: u64, refill_rate: f64) -> RateLimitResult<Self> {
        require_limit("max_tokens", max_tokens)?;
        require_rate("refill_rate", refill_rate)?;

        let updater = Arc::new(ReadThenWrite::new(ctx.store.clone()));
        debug!(
            namespace = %ctx.keys.base_key(),
            max_tokens = max_tokens,
            refill_rate = refill_rate,
            "Created token bucket"
        );

        Ok(Self {
            ctx,
            max_tokens,
            refill_rate,
            updater,
        })
    }

    /// Use a different read-compute-write strategy
    pub fn with_updater(mut self, updater: Arc<dyn BucketStateUpdater>) -> Self {
        self.updater = updater;
        self
    }

    /// Maximum tokens
    pub fn max_tokens(&self) -> u64 {
        self.max_tokens
    }

    /// Refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Stored state for `caller`, if any
    pub async fn state(&self, caller: &str) -> RateLimitResult<Option<BucketState>> {
        self.updater.load(&self.ctx.keys.key(caller)).await
    }

    /// Overwrite the level for `caller` with what has accrued since
    /// `last_refill`.
    ///
    /// The previous level is discarded: the new level is
    /// `min(max_tokens, floor((now - last_refill) * refill_rate))`. Returns
    /// the new level.
    pub async fn refill(&self, caller: &str, last_refill: Timestamp) -> RateLimitResult<u64> {
        let key = self.ctx.keys.key(caller);
        let now = self.ctx.clock.now();
        let tokens = accrued(now.saturating_duration_since(last_refill), self.refill_rate)
            .min(self.max_tokens);
        let capacity = self.max_tokens;

        self.updater
            .check_and_update(&key, &move |_| BucketOutcome {
                write: Some(BucketState::new(tokens, now)),
                decision: Decision::allowed(Some(DecisionDetail::Bucket { tokens, capacity })),
            })
            .await?;

        debug!(key = %key, tokens = tokens, "Refilled token bucket");
        Ok(tokens)
    }
}

/// Whole tokens produced by `rate` over `elapsed`
pub(crate) fn accrued(elapsed: Duration, rate: f64) -> u64 {
    let tokens = (elapsed.as_secs_f64() * rate).floor();
    if tokens >= u64::MAX as f64 {
        u64::MAX
    } else {
        tokens as u64
    }
}

/// Apply lazy refill and take one token.
fn take_token(
    current: Option<BucketState>,
    now: Timestamp,
    max_tokens: u64,
    refill_rate: f64,
) -> BucketOutcome {
    let mut state = current.unwrap_or(BucketState::new(max_tokens, now));
    state.tokens = state.tokens.min(max_tokens);

    let refilled = accrued(now.saturating_duration_since(state.updated_at), refill_rate);
    if refilled >= 1 {
        state.tokens = state.tokens.saturating_add(refilled).min(max_tokens);
        // Only credit the time the refilled tokens actually took
        let spent =
            Duration::try_from_secs_f64(refilled as f64 / refill_rate).unwrap_or(Duration::MAX);
        state.updated_at = state.updated_at.saturating_add(spent).min(now);
    }
    if state.tokens == max_tokens {
        state.updated_at = now;
    }

    if state.tokens == 0 {
        return BucketOutcome {
            write: None,
            decision: Decision::limited(Some(DecisionDetail::Bucket {
                tokens: 0,
                capacity: max_tokens,
            })),
        };
    }

    state.tokens -= 1;
    BucketOutcome {
        write: Some(state),
        decision: Decision::allowed(Some(DecisionDetail::Bucket {
            tokens: state.tokens,
            capacity: max_tokens,
        })),
    }
}

#[async_trait]
impl AdmissionPolicy for TokenBucket {
    async fn evaluate(
        &self,
        caller: &str,
        override_limit: Option<u64>,
    ) -> RateLimitResult<Decision> {
        let key = self.ctx.keys.key(caller);
        let now = self.ctx.clock.now();
        let max_tokens = override_limit.unwrap_or(self.max_tokens);
        let refill_rate = self.refill_rate;

        let decision = self
            .updater
            .check_and_update(&key, &move |current| {
                take_token(current, now, max_tokens, refill_rate)
            })
            .await?;

        if decision.limited {
            warn!(key = %key, max_tokens = max_tokens, "Token bucket empty");
        } else {
            trace!(key = %key, detail = ?decision.detail, "Token bucket admitted request");
        }

        Ok(decision)
    }

    async fn reset(&self, caller: &str) -> RateLimitResult<()> {
        let key = self.ctx.keys.key(caller);
        debug!(key = %key, "Resetting token bucket");
        self.ctx.store.delete(&key).await
    }

    fn name(&self) -> &'static str {
        "token_bucket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::LocalKeyLock;
    use crate::error::RateLimitError;
    use crate::key::KeyBuilder;
    use crate::stores::testing::DownStore;
    use crate::stores::{AdmissionStore, MemoryStore};
    use crate::time::{Clock, ManualClock};

    const START: Timestamp = Timestamp::from_millis(1_700_000_000_000);

    fn setup(
        max_tokens: u64,
        refill_rate: f64,
    ) -> (TokenBucket, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let ctx = PolicyContext::new(store.clone(), KeyBuilder::new("rl", "app", "login"))
            .with_clock(clock.clone());
        let bucket = TokenBucket::new(ctx, max_tokens, refill_rate).unwrap();
        (bucket, store, clock)
    }

    #[tokio::test]
    async fn test_admits_max_tokens_then_limits() {
        let (bucket, _store, _clock) = setup(5, 1.0);

        for _ in 0..5 {
            assert!(bucket.evaluate("user1", None).await.unwrap().is_allowed());
        }
        let decision = bucket.evaluate("user1", None).await.unwrap();
        assert!(decision.limited);
        assert_eq!(
            decision.detail,
            Some(DecisionDetail::Bucket {
                tokens: 0,
                capacity: 5
            })
        );
    }

    #[tokio::test]
    async fn test_rejection_is_monotonic_at_fixed_instant() {
        let (bucket, _store, _clock) = setup(3, 1.0);

        let mut seen_limited = false;
        for _ in 0..10 {
            let limited = bucket.evaluate("user1", None).await.unwrap().limited;
            assert!(!(seen_limited && !limited));
            seen_limited |= limited;
        }
        assert!(seen_limited);
    }

    #[tokio::test]
    async fn test_refill_restores_elapsed_tokens() {
        let (bucket, _store, clock) = setup(5, 1.0);

        for _ in 0..5 {
            bucket.evaluate("user1", None).await.unwrap();
        }
        assert!(bucket.evaluate("user1", None).await.unwrap().limited);

        clock.advance(Duration::from_secs(2));
        assert!(bucket.evaluate("user1", None).await.unwrap().is_allowed());
        assert!(bucket.evaluate("user1", None).await.unwrap().is_allowed());
        assert!(bucket.evaluate("user1", None).await.unwrap().limited);
    }

    #[tokio::test]
    async fn test_refill_never_exceeds_max_tokens() {
        let (bucket, _store, clock) = setup(5, 10.0);

        bucket.evaluate("user1", None).await.unwrap();
        clock.advance(Duration::from_secs(3_600));

        let decision = bucket.evaluate("user1", None).await.unwrap();
        assert_eq!(
            decision.detail,
            Some(DecisionDetail::Bucket {
                tokens: 4,
                capacity: 5
            })
        );
        let state = bucket.state("user1").await.unwrap().unwrap();
        assert_eq!(state.tokens, 4);
        assert_eq!(state.updated_at, clock.now());
    }

    #[tokio::test]
    async fn test_partial_refill_keeps_fractional_progress() {
        let (bucket, _store, clock) = setup(5, 1.0);

        for _ in 0..5 {
            bucket.evaluate("user1", None).await.unwrap();
        }

        // 1.5s gives one token; the remaining half second carries over
        clock.advance(Duration::from_millis(1_500));
        assert!(bucket.evaluate("user1", None).await.unwrap().is_allowed());
        assert_eq!(
            bucket.state("user1").await.unwrap().unwrap().updated_at,
            START.saturating_add(Duration::from_secs(1))
        );

        clock.advance(Duration::from_millis(500));
        assert!(bucket.evaluate("user1", None).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_limited_evaluation_writes_nothing() {
        let (bucket, _store, _clock) = setup(1, 1.0);

        bucket.evaluate("user1", None).await.unwrap();
        let before = bucket.state("user1").await.unwrap();
        assert!(bucket.evaluate("user1", None).await.unwrap().limited);
        assert_eq!(bucket.state("user1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_override_limit_is_max_tokens() {
        let (bucket, _store, _clock) = setup(10, 1.0);

        assert!(bucket.evaluate("user1", Some(2)).await.unwrap().is_allowed());
        assert!(bucket.evaluate("user1", Some(2)).await.unwrap().is_allowed());
        assert!(bucket.evaluate("user1", Some(2)).await.unwrap().limited);
    }

    #[tokio::test]
    async fn test_refill_replaces_level() {
        let (bucket, _store, clock) = setup(5, 2.0);

        for _ in 0..4 {
            bucket.evaluate("user1", None).await.unwrap();
        }

        let last_refill = clock.now().saturating_sub(Duration::from_secs(1));
        assert_eq!(bucket.refill("user1", last_refill).await.unwrap(), 2);
        assert_eq!(
            bucket.state("user1").await.unwrap(),
            Some(BucketState::new(2, clock.now()))
        );

        let long_ago = clock.now().saturating_sub(Duration::from_secs(60));
        assert_eq!(bucket.refill("user1", long_ago).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_malformed_state_is_error() {
        let (bucket, store, _clock) = setup(5, 1.0);

        store
            .hash_set_all(
                "rl-app-login-user1",
                &[("tokens".to_string(), "lots".to_string())],
            )
            .await
            .unwrap();

        assert!(matches!(
            bucket.evaluate("user1", None).await,
            Err(RateLimitError::MalformedState { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_refills_bucket() {
        let (bucket, _store, _clock) = setup(1, 1.0);

        bucket.evaluate("user1", None).await.unwrap();
        assert!(bucket.evaluate("user1", None).await.unwrap().limited);

        bucket.reset("user1").await.unwrap();
        assert!(bucket.evaluate("user1", None).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_with_local_key_lock() {
        let (bucket, store, _clock) = setup(2, 1.0);
        let bucket = bucket.with_updater(Arc::new(LocalKeyLock::new(store)));

        assert!(bucket.evaluate("user1", None).await.unwrap().is_allowed());
        assert!(bucket.evaluate("user1", None).await.unwrap().is_allowed());
        assert!(bucket.evaluate("user1", None).await.unwrap().limited);
    }

    #[test]
    fn test_accrued() {
        assert_eq!(accrued(Duration::from_millis(999), 1.0), 0);
        assert_eq!(accrued(Duration::from_secs(3), 2.5), 7);
        assert_eq!(accrued(Duration::from_secs(u64::MAX / 2), 1e9), u64::MAX);
    }

    #[tokio::test]
    async fn test_store_failure_is_error() {
        let ctx = PolicyContext::new(Arc::new(DownStore), KeyBuilder::default());
        let bucket = TokenBucket::new(ctx, 5, 1.0).unwrap();

        assert!(bucket.evaluate("user1", None).await.unwrap_err().is_store_failure());
        assert!(bucket.state("user1").await.unwrap_err().is_store_failure());
        assert!(
            bucket
                .refill("user1", Timestamp::from_millis(0))
                .await
                .unwrap_err()
                .is_store_failure()
        );
    }
}
