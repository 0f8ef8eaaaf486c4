//! In-memory rate limit store
//!
//! Uses DashMap for thread-safe concurrent access and mirrors the Redis
//! semantics of each primitive, including key expiry measured against an
//! injectable [`Clock`]. Suitable for single-instance deployments or testing.
//! For distributed deployments, use the Redis store.

use crate::error::{RateLimitError, RateLimitResult};
use crate::stores::AdmissionStore;
use crate::time::{Clock, SystemClock, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug, Clone)]
enum Value {
    Counter(i64),
    SortedSet(HashMap<String, i64>),
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Timestamp>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory rate limit store
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a new in-memory store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new in-memory store whose expiry follows `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        debug!("Creating new in-memory rate limit store");
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Get the number of live keys (for monitoring)
    pub fn key_count(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        debug!(removed = removed, "Purged expired entries");
        removed
    }

    /// Remaining time-to-live of a key, `None` when absent or persistent
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn purge_if_expired(&self, key: &str) {
        let now = self.clock.now();
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
    }

    fn with_entry<T>(
        &self,
        key: &str,
        init: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Value) -> RateLimitResult<T>,
    ) -> RateLimitResult<T> {
        self.purge_if_expired(key);
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(init()));
        f(&mut entry.value)
    }

    fn read<T>(
        &self,
        key: &str,
        absent: T,
        f: impl FnOnce(&Value) -> RateLimitResult<T>,
    ) -> RateLimitResult<T> {
        self.purge_if_expired(key);
        match self.entries.get(key) {
            Some(entry) => f(&entry.value),
            None => Ok(absent),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.entries.len())
            .finish()
    }
}

/// Resolve Redis-style inclusive indices against a list of `len` elements
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl AdmissionStore for MemoryStore {
    async fn increment(&self, key: &str) -> RateLimitResult<i64> {
        self.with_entry(
            key,
            || Value::Counter(0),
            |value| match value {
                Value::Counter(count) => {
                    *count += 1;
                    trace!(key = %key, count = *count, "Counter incremented");
                    Ok(*count)
                }
                _ => Err(RateLimitError::store(WRONG_TYPE)),
            },
        )
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RateLimitResult<()> {
        self.purge_if_expired(key);
        let expires_at = self.clock.now().saturating_add(ttl);
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(expires_at);
        }
        Ok(())
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> RateLimitResult<()> {
        self.with_entry(
            key,
            || Value::SortedSet(HashMap::new()),
            |value| match value {
                Value::SortedSet(members) => {
                    members.insert(member.to_string(), score);
                    Ok(())
                }
                _ => Err(RateLimitError::store(WRONG_TYPE)),
            },
        )
    }

    async fn sorted_set_prune_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> RateLimitResult<u64> {
        self.purge_if_expired(key);
        let removed = match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let (removed, now_empty) = match &mut occupied.get_mut().value {
                    Value::SortedSet(members) => {
                        let before = members.len();
                        members.retain(|_, score| *score < min || *score > max);
                        ((before - members.len()) as u64, members.is_empty())
                    }
                    _ => return Err(RateLimitError::store(WRONG_TYPE)),
                };
                if now_empty {
                    occupied.remove();
                }
                removed
            }
            MapEntry::Vacant(_) => 0,
        };
        Ok(removed)
    }

    async fn sorted_set_count_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> RateLimitResult<u64> {
        self.read(key, 0, |value| match value {
            Value::SortedSet(members) => Ok(members
                .values()
                .filter(|score| **score >= min && **score <= max)
                .count() as u64),
            _ => Err(RateLimitError::store(WRONG_TYPE)),
        })
    }

    async fn list_append(&self, key: &str, value: &str) -> RateLimitResult<u64> {
        self.with_entry(
            key,
            || Value::List(VecDeque::new()),
            |stored| match stored {
                Value::List(items) => {
                    items.push_back(value.to_string());
                    Ok(items.len() as u64)
                }
                _ => Err(RateLimitError::store(WRONG_TYPE)),
            },
        )
    }

    async fn list_len(&self, key: &str) -> RateLimitResult<u64> {
        self.read(key, 0, |value| match value {
            Value::List(items) => Ok(items.len() as u64),
            _ => Err(RateLimitError::store(WRONG_TYPE)),
        })
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> RateLimitResult<()> {
        self.purge_if_expired(key);
        if let MapEntry::Occupied(mut occupied) = self.entries.entry(key.to_string()) {
            let now_empty = match &mut occupied.get_mut().value {
                Value::List(items) => {
                    match resolve_range(items.len(), start, stop) {
                        Some((from, to)) => {
                            items.truncate(to + 1);
                            items.drain(..from);
                        }
                        None => items.clear(),
                    }
                    items.is_empty()
                }
                _ => return Err(RateLimitError::store(WRONG_TYPE)),
            };
            if now_empty {
                occupied.remove();
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> RateLimitResult<Vec<String>> {
        self.read(key, Vec::new(), |value| match value {
            Value::List(items) => Ok(match resolve_range(items.len(), start, stop) {
                Some((from, to)) => items.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            _ => Err(RateLimitError::store(WRONG_TYPE)),
        })
    }

    async fn hash_get_all(&self, key: &str) -> RateLimitResult<HashMap<String, String>> {
        self.read(key, HashMap::new(), |value| match value {
            Value::Hash(fields) => Ok(fields.clone()),
            _ => Err(RateLimitError::store(WRONG_TYPE)),
        })
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> RateLimitResult<()> {
        self.with_entry(
            key,
            || Value::Hash(HashMap::new()),
            |value| match value {
                Value::Hash(stored) => {
                    for (field, val) in fields {
                        stored.insert(field.clone(), val.clone());
                    }
                    Ok(())
                }
                _ => Err(RateLimitError::store(WRONG_TYPE)),
            },
        )
    }

    async fn delete(&self, key: &str) -> RateLimitResult<()> {
        debug!(key = %key, "Deleting rate limit state");
        self.entries.remove(key);
        Ok(())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn store_with_clock() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1_000_000)));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_increment_and_expire() {
        let (store, clock) = store_with_clock();

        assert_eq!(store.increment("c").await.unwrap(), 1);
        store.expire("c", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.increment("c").await.unwrap(), 2);
        assert_eq!(store.ttl("c"), Some(Duration::from_secs(10)));

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.ttl("c"), None);
        assert_eq!(store.increment("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expire_missing_key_is_noop() {
        let (store, _) = store_with_clock();
        store.expire("missing", Duration::from_secs(1)).await.unwrap();
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_sorted_set_inclusive_bounds() {
        let (store, _) = store_with_clock();
        for score in [10, 20, 30, 40] {
            store
                .sorted_set_add("z", score, &format!("m{}", score))
                .await
                .unwrap();
        }

        assert_eq!(store.sorted_set_count_by_score("z", 20, 30).await.unwrap(), 2);
        assert_eq!(store.sorted_set_prune_by_score("z", 0, 20).await.unwrap(), 2);
        assert_eq!(store.sorted_set_count_by_score("z", 0, 100).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sorted_set_same_member_updates_score() {
        let (store, _) = store_with_clock();
        store.sorted_set_add("z", 1, "a").await.unwrap();
        store.sorted_set_add("z", 5, "a").await.unwrap();
        assert_eq!(store.sorted_set_count_by_score("z", 0, 10).await.unwrap(), 1);
        assert_eq!(store.sorted_set_count_by_score("z", 0, 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_negative_indices() {
        let (store, _) = store_with_clock();
        for v in ["a", "b", "c", "d", "e"] {
            store.list_append("l", v).await.unwrap();
        }

        assert_eq!(store.list_range("l", -2, -1).await.unwrap(), vec!["d", "e"]);
        assert_eq!(store.list_range("l", -10, -1).await.unwrap().len(), 5);
        assert_eq!(store.list_range("l", 3, 100).await.unwrap(), vec!["d", "e"]);
        assert!(store.list_range("l", 4, 2).await.unwrap().is_empty());

        store.list_trim("l", 2, -1).await.unwrap();
        assert_eq!(store.list_len("l").await.unwrap(), 3);
        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec!["c", "d", "e"]);

        store.list_trim("l", 5, -1).await.unwrap();
        assert_eq!(store.list_len("l").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_hash_round_trip() {
        let (store, _) = store_with_clock();
        assert!(store.hash_get_all("h").await.unwrap().is_empty());

        store
            .hash_set_all("h", &[("tokens".into(), "3".into()), ("updated_at".into(), "9".into())])
            .await
            .unwrap();
        store
            .hash_set_all("h", &[("tokens".into(), "2".into())])
            .await
            .unwrap();

        let fields = store.hash_get_all("h").await.unwrap();
        assert_eq!(fields.get("tokens").map(String::as_str), Some("2"));
        assert_eq!(fields.get("updated_at").map(String::as_str), Some("9"));
    }

    #[tokio::test]
    async fn test_wrong_type_is_store_error() {
        let (store, _) = store_with_clock();
        store.list_append("k", "x").await.unwrap();
        let err = store.increment("k").await.unwrap_err();
        assert!(err.is_store_failure());
        assert!(store.hash_get_all("k").await.is_err());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();
        store.increment("a").await.unwrap();
        store.increment("b").await.unwrap();
        store.expire("a", Duration::from_secs(1)).await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.key_count(), 1);
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _) = store_with_clock();
        store.increment("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_store_type() {
        let store = MemoryStore::new();
        assert_eq!(store.store_type(), "memory");
    }
}
