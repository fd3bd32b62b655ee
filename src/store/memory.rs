//! In-process coordination store.
//!
//! Useful for tests and for several limiters sharing budgets inside one
//! process. Each transition runs under the map shard's write lock, which
//! gives the same per-key atomicity the Redis script provides.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{BucketRequest, CoordinationStore, StoreError};
use crate::ratelimit::{BucketLimits, BucketState};

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at_ms: u64,
}

impl StoredBucket {
    fn full(limits: &BucketLimits, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            state: BucketState::full(limits, now_ms),
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        }
    }
}

/// Coordination store held in a concurrent map.
///
/// Expiry is evaluated against the `now_ms` carried by each request.
#[derive(Debug)]
pub struct MemoryStore {
    buckets: DashMap<String, StoredBucket>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Tokens stored for `key`, if present and not expired at `now_ms`.
    pub fn tokens(&self, key: &str, now_ms: u64) -> Option<f64> {
        self.buckets
            .get(key)
            .filter(|b| b.expires_at_ms > now_ms)
            .map(|b| b.state.tokens())
    }

    /// Drop keys whose expiry has passed at `now_ms`. Returns the number removed.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, b| b.expires_at_ms > now_ms);
        before - self.buckets.len()
    }

    /// Get the number of stored keys, expired or not.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn acquire(&self, request: &BucketRequest<'_>) -> Result<bool, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".to_string()));
        }

        let limits = BucketLimits::new(request.rate, request.capacity);
        let now_ms = request.now_ms;
        let ttl_ms = request.ttl.as_millis() as u64;

        let mut entry = self
            .buckets
            .entry(request.key.to_string())
            .or_insert_with(|| StoredBucket::full(&limits, now_ms, ttl_ms));

        // Expired state behaves as if the key had never existed.
        if entry.expires_at_ms <= now_ms {
            *entry = StoredBucket::full(&limits, now_ms, ttl_ms);
        }

        let allowed = entry.state.try_consume(&limits, now_ms);
        entry.expires_at_ms = now_ms.saturating_add(ttl_ms);

        Ok(allowed)
    }
}
