//! Bucket state shared by the token and leaky bucket policies
//!
//! Both buckets persist `{tokens, updated_at}` as a hash and update it with
//! one read-compute-write per evaluation. How that cycle is protected against
//! concurrent callers is pluggable through [`BucketStateUpdater`].

use crate::decision::Decision;
use crate::error::{RateLimitError, RateLimitResult};
use crate::stores::AdmissionStore;
use crate::time::Timestamp;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

pub(crate) const TOKENS_FIELD: &str = "tokens";
pub(crate) const UPDATED_AT_FIELD: &str = "updated_at";

/// Persisted bucket level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    /// Current token count
    pub tokens: u64,
    /// Last time the level was recomputed
    pub updated_at: Timestamp,
}

impl BucketState {
    /// Create a new state
    pub fn new(tokens: u64, updated_at: Timestamp) -> Self {
        Self { tokens, updated_at }
    }

    /// Decode a stored hash.
    ///
    /// An empty hash is absent state. A hash missing either field, or holding
    /// a value that does not parse, is malformed.
    pub fn from_fields(
        key: &str,
        fields: &HashMap<String, String>,
    ) -> RateLimitResult<Option<Self>> {
        if fields.is_empty() {
            return Ok(None);
        }

        let tokens = fields
            .get(TOKENS_FIELD)
            .ok_or_else(|| RateLimitError::malformed(key, "missing tokens field"))?;
        let updated_at = fields
            .get(UPDATED_AT_FIELD)
            .ok_or_else(|| RateLimitError::malformed(key, "missing updated_at field"))?;

        let tokens = tokens.trim().parse::<u64>().map_err(|_| {
            RateLimitError::malformed(key, format!("tokens {:?} is not a number", tokens))
        })?;
        let updated_at = Timestamp::parse_stored(key, updated_at)?;

        Ok(Some(Self { tokens, updated_at }))
    }

    /// Encode as hash fields
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (TOKENS_FIELD.to_string(), self.tokens.to_string()),
            (UPDATED_AT_FIELD.to_string(), self.updated_at.as_millis().to_string()),
        ]
    }
}

/// Result of applying a bucket transition to the current state
#[derive(Debug, Clone, PartialEq)]
pub struct BucketOutcome {
    /// State to persist, `None` to leave the store untouched
    pub write: Option<BucketState>,
    /// Decision to hand back to the caller
    pub decision: Decision,
}

/// Pure state transition: current state (if any) to outcome
pub type BucketTransition = dyn Fn(Option<BucketState>) -> BucketOutcome + Send + Sync;

/// Strategy for the read-compute-write cycle of bucket state
#[async_trait]
pub trait BucketStateUpdater: Send + Sync + fmt::Debug {
    /// Read the state at `key`, apply `transition`, persist its write if any
    async fn check_and_update(
        &self,
        key: &str,
        transition: &BucketTransition,
    ) -> RateLimitResult<Decision>;

    /// Read the state at `key` without modifying it
    async fn load(&self, key: &str) -> RateLimitResult<Option<BucketState>>;
}

/// Plain `hash_get_all`, compute, `hash_set_all`.
///
/// Two concurrent evaluations of the same key can both read the same state
/// and both write; the later write wins. Pick [`LocalKeyLock`] or the Redis
/// watched updater when that matters.
#[derive(Clone)]
pub struct ReadThenWrite {
    store: Arc<dyn AdmissionStore>,
}

impl ReadThenWrite {
    /// Update state directly in `store`
    pub fn new(store: Arc<dyn AdmissionStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for ReadThenWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadThenWrite")
            .field("store", &self.store.store_type())
            .finish()
    }
}

#[async_trait]
impl BucketStateUpdater for ReadThenWrite {
    async fn check_and_update(
        &self,
        key: &str,
        transition: &BucketTransition,
    ) -> RateLimitResult<Decision> {
        let current = self.load(key).await?;
        let outcome = transition(current);

        if let Some(state) = outcome.write {
            trace!(key = %key, tokens = state.tokens, "Writing bucket state");
            self.store.hash_set_all(key, &state.to_fields()).await?;
        }

        Ok(outcome.decision)
    }

    async fn load(&self, key: &str) -> RateLimitResult<Option<BucketState>> {
        let fields = self.store.hash_get_all(key).await?;
        BucketState::from_fields(key, &fields)
    }
}

/// Serializes evaluations of the same key within this process.
///
/// Each key gets a `tokio` mutex for the duration of the wrapped update.
/// Entries are dropped as soon as no evaluation holds or waits on them.
/// Other processes sharing the store are not coordinated.
pub struct LocalKeyLock {
    inner: Arc<dyn BucketStateUpdater>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalKeyLock {
    /// Lock around a plain read-then-write on `store`
    pub fn new(store: Arc<dyn AdmissionStore>) -> Self {
        Self::wrap(Arc::new(ReadThenWrite::new(store)))
    }

    /// Lock around any other updater
    pub fn wrap(inner: Arc<dyn BucketStateUpdater>) -> Self {
        Self {
            inner,
            locks: DashMap::new(),
        }
    }

    /// Number of keys currently locked or awaited
    pub fn active_keys(&self) -> usize {
        self.locks.len()
    }
}

impl fmt::Debug for LocalKeyLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyLock")
            .field("inner", &self.inner)
            .field("active_keys", &self.locks.len())
            .finish()
    }
}

/// A caller's claim on one key's mutex.
///
/// Dropping it removes the map entry once nobody else holds or awaits the
/// mutex, including when the owning future is cancelled mid-wait.
struct KeyLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> KeyLease<'a> {
    fn acquire(locks: &'a DashMap<String, Arc<Mutex<()>>>, key: &'a str) -> Self {
        let lock = Arc::clone(&locks.entry(key.to_string()).or_default());
        Self { locks, key, lock }
    }
}

impl Drop for KeyLease<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and this lease's
        self.locks.remove_if(self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

#[async_trait]
impl BucketStateUpdater for LocalKeyLock {
    async fn check_and_update(
        &self,
        key: &str,
        transition: &BucketTransition,
    ) -> RateLimitResult<Decision> {
        let lease = KeyLease::acquire(&self.locks, key);
        let _guard = lease.lock.lock().await;
        self.inner.check_and_update(key, transition).await
    }

    async fn load(&self, key: &str) -> RateLimitResult<Option<BucketState>> {
        self.inner.load(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DecisionDetail;
    use crate::stores::MemoryStore;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn take_one(current: Option<BucketState>) -> BucketOutcome {
        let state = current.unwrap_or(BucketState::new(3, Timestamp::from_millis(0)));
        if state.tokens == 0 {
            return BucketOutcome {
                write: None,
                decision: Decision::limited(None),
            };
        }
        let next = BucketState::new(state.tokens - 1, state.updated_at);
        BucketOutcome {
            write: Some(next),
            decision: Decision::allowed(Some(DecisionDetail::Bucket {
                tokens: next.tokens,
                capacity: 3,
            })),
        }
    }

    #[test]
    fn test_from_fields() {
        assert_eq!(BucketState::from_fields("k", &HashMap::new()).unwrap(), None);
        assert_eq!(
            BucketState::from_fields("k", &fields(&[("tokens", "4"), ("updated_at", "1500")]))
                .unwrap(),
            Some(BucketState::new(4, Timestamp::from_millis(1_500)))
        );
    }

    #[test]
    fn test_from_fields_malformed() {
        let cases = [
            fields(&[("tokens", "4")]),
            fields(&[("updated_at", "1500")]),
            fields(&[("tokens", "four"), ("updated_at", "1500")]),
            fields(&[("tokens", "-1"), ("updated_at", "1500")]),
            fields(&[("tokens", "4"), ("updated_at", "soon")]),
        ];
        for case in cases {
            assert!(matches!(
                BucketState::from_fields("k", &case),
                Err(RateLimitError::MalformedState { .. })
            ));
        }
    }

    #[test]
    fn test_to_fields() {
        let state = BucketState::new(7, Timestamp::from_millis(99));
        let encoded: HashMap<String, String> = state.to_fields().into_iter().collect();
        assert_eq!(BucketState::from_fields("k", &encoded).unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_read_then_write() {
        let store = Arc::new(MemoryStore::new());
        let updater = ReadThenWrite::new(store.clone());

        for _ in 0..3 {
            assert!(updater.check_and_update("b", &take_one).await.unwrap().is_allowed());
        }
        assert!(updater.check_and_update("b", &take_one).await.unwrap().limited);
        assert_eq!(updater.load("b").await.unwrap().unwrap().tokens, 0);
    }

    #[tokio::test]
    async fn test_no_write_leaves_store_untouched() {
        let store = Arc::new(MemoryStore::new());
        let updater = ReadThenWrite::new(store.clone());

        let decision = updater
            .check_and_update("b", &|_| BucketOutcome {
                write: None,
                decision: Decision::limited(None),
            })
            .await
            .unwrap();
        assert!(decision.limited);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_local_key_lock_serializes_updates() {
        let store = Arc::new(MemoryStore::new());
        let updater = Arc::new(LocalKeyLock::new(store.clone()));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let updater = updater.clone();
            handles.push(tokio::spawn(async move {
                updater.check_and_update("b", &take_one).await.unwrap()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }

        assert_eq!(allowed, 3);
        assert_eq!(updater.active_keys(), 0);
    }

    #[derive(Debug)]
    struct Stalled;

    #[async_trait]
    impl BucketStateUpdater for Stalled {
        async fn check_and_update(
            &self,
            _key: &str,
            _transition: &BucketTransition,
        ) -> RateLimitResult<Decision> {
            std::future::pending().await
        }

        async fn load(&self, _key: &str) -> RateLimitResult<Option<BucketState>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_cancelled_updates_release_key() {
        let updater = LocalKeyLock::wrap(Arc::new(Stalled));
        let wait = std::time::Duration::from_millis(20);

        // One holder stuck inside the update, one waiting on the mutex
        let (holder, waiter) = tokio::join!(
            tokio::time::timeout(wait, updater.check_and_update("b", &take_one)),
            tokio::time::timeout(wait, updater.check_and_update("b", &take_one)),
        );
        assert!(holder.is_err());
        assert!(waiter.is_err());
        assert_eq!(updater.active_keys(), 0);
    }
}
