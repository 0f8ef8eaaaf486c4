//! Store doubles for unit tests

use super::{AdmissionStore, MemoryStore};
use crate::error::{RateLimitError, RateLimitResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Wraps a [`MemoryStore`] and records every expiry that was set
pub(crate) struct RecordingStore {
    inner: MemoryStore,
    expires: Mutex<Vec<(String, Duration)>>,
}

impl RecordingStore {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            expires: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn expires(&self) -> Vec<(String, Duration)> {
        self.expires.lock().unwrap().clone()
    }
}

#[async_trait]
impl AdmissionStore for RecordingStore {
    async fn increment(&self, key: &str) -> RateLimitResult<i64> {
        self.inner.increment(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RateLimitResult<()> {
        self.expires.lock().unwrap().push((key.to_string(), ttl));
        self.inner.expire(key, ttl).await
    }

    async fn sorted_set_add(&self, key: &str, score: i64, member: &str) -> RateLimitResult<()> {
        self.inner.sorted_set_add(key, score, member).await
    }

    async fn sorted_set_prune_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> RateLimitResult<u64> {
        self.inner.sorted_set_prune_by_score(key, min, max).await
    }

    async fn sorted_set_count_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> RateLimitResult<u64> {
        self.inner.sorted_set_count_by_score(key, min, max).await
    }

    async fn list_append(&self, key: &str, value: &str) -> RateLimitResult<u64> {
        self.inner.list_append(key, value).await
    }

    async fn list_len(&self, key: &str) -> RateLimitResult<u64> {
        self.inner.list_len(key).await
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> RateLimitResult<()> {
        self.inner.list_trim(key, start, stop).await
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> RateLimitResult<Vec<String>> {
        self.inner.list_range(key, start, stop).await
    }

    async fn hash_get_all(&self, key: &str) -> RateLimitResult<HashMap<String, String>> {
        self.inner.hash_get_all(key).await
    }

    async fn hash_set_all(&self, key: &str, fields: &[(String, String)]) -> RateLimitResult<()> {
        self.inner.hash_set_all(key, fields).await
    }

    async fn delete(&self, key: &str) -> RateLimitResult<()> {
        self.inner.delete(key).await
    }

    fn store_type(&self) -> &'static str {
        "recording"
    }
}

/// Store that fails every call as if the backend were unreachable
pub(crate) struct DownStore;

fn refused<T>() -> RateLimitResult<T> {
    Err(RateLimitError::store("connection refused"))
}

#[async_trait]
impl AdmissionStore for DownStore {
    async fn increment(&self, _key: &str) -> RateLimitResult<i64> {
        refused()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> RateLimitResult<()> {
        refused()
    }

    async fn sorted_set_add(&self, _key: &str, _score: i64, _member: &str) -> RateLimitResult<()> {
        refused()
    }

    async fn sorted_set_prune_by_score(
        &self,
        _key: &str,
        _min: i64,
        _max: i64,
    ) -> RateLimitResult<u64> {
        refused()
    }

    async fn sorted_set_count_by_score(
        &self,
        _key: &str,
        _min: i64,
        _max: i64,
    ) -> RateLimitResult<u64> {
        refused()
    }

    async fn list_append(&self, _key: &str, _value: &str) -> RateLimitResult<u64> {
        refused()
    }

    async fn list_len(&self, _key: &str) -> RateLimitResult<u64> {
        refused()
    }

    async fn list_trim(&self, _key: &str, _start: i64, _stop: i64) -> RateLimitResult<()> {
        refused()
    }

    async fn list_range(
        &self,
        _key: &str,
        _start: i64,
        _stop: i64,
    ) -> RateLimitResult<Vec<String>> {
        refused()
    }

    async fn hash_get_all(&self, _key: &str) -> RateLimitResult<HashMap<String, String>> {
        refused()
    }

    async fn hash_set_all(&self, _key: &str, _fields: &[(String, String)]) -> RateLimitResult<()> {
        refused()
    }

    async fn delete(&self, _key: &str) -> RateLimitResult<()> {
        refused()
    }

    fn store_type(&self) -> &'static str {
        "down"
    }
}
