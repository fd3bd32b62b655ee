//! In-process token buckets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{BackendKind, Decision, RateLimiterBackend};
use super::bucket::{BucketLimits, BucketState};
use super::clock::Clock;

/// A bucket as stored in the map.
#[derive(Debug)]
struct Slot {
    state: BucketState,
    /// Set under the slot's mutex when a sweep drops it from the map; a
    /// caller still holding the slot must look the key up again.
    evicted: bool,
}

type SharedSlot = Arc<Mutex<Slot>>;

/// Token buckets held in process memory, one per partition key.
///
/// The key map is read concurrently and write-locked only to insert a new
/// bucket (or during an idle sweep). Each bucket carries its own mutex, so
/// admissions on different keys never contend.
pub struct LocalBucketStore {
    /// Buckets indexed by partition key
    buckets: RwLock<HashMap<String, SharedSlot>>,
    /// Refill parameters shared by all buckets
    limits: BucketLimits,
}

impl LocalBucketStore {
    /// Create an empty store.
    pub fn new(limits: BucketLimits) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            limits,
        }
    }

    /// Refill and try to consume one token from the bucket for `key`.
    pub fn allow(&self, key: &str, now_ms: u64) -> Decision {
        let (allowed, tokens) = loop {
            let bucket = self.bucket(key, now_ms);
            let mut slot = bucket.lock();
            if slot.evicted {
                continue;
            }
            let allowed = slot.state.try_consume(&self.limits, now_ms);
            break (allowed, slot.state.tokens());
        };

        trace!(
            key = %key,
            tokens = tokens,
            allowed = allowed,
            "Local bucket checked"
        );

        if !allowed {
            debug!(key = %key, "Local rate limit exceeded");
        }

        Decision::from(allowed)
    }

    /// Look up the bucket for `key`, creating a full one on first sight.
    fn bucket(&self, key: &str, now_ms: u64) -> SharedSlot {
        if let Some(bucket) = self.buckets.read().get(key) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();
        // Another caller may have inserted while we waited for the write lock.
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = self.limits.capacity,
                rate = self.limits.rate,
                "Creating new token bucket"
            );
            Arc::new(Mutex::new(Slot {
                state: BucketState::full(&self.limits, now_ms),
                evicted: false,
            }))
        });
        Arc::clone(bucket)
    }

    /// Snapshot of the tokens held for `key`, as of its last transition.
    ///
    /// Returns `None` if no bucket exists for the key.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let buckets = self.buckets.read();
        buckets.get(key).map(|b| b.lock().state.tokens())
    }

    /// Remove buckets untouched for at least `max_idle` that have also
    /// refilled to capacity by `now_ms`.
    ///
    /// Only full buckets are dropped, since a full bucket is exactly what the
    /// next request would recreate. A bucket still short of capacity stays
    /// however long it has been idle. Returns the number removed.
    pub fn sweep_idle(&self, now_ms: u64, max_idle: Duration) -> usize {
        let max_idle_ms = max_idle.as_millis() as u64;
        let limits = self.limits;
        let mut buckets = self.buckets.write();
        let before = buckets.len();

        buckets.retain(|_, bucket| {
            let mut slot = bucket.lock();
            let stale = slot.state.idle_for_ms(now_ms) >= max_idle_ms
                && slot.state.is_full_at(&limits, now_ms);
            if stale {
                slot.evicted = true;
            }
            !stale
        });

        let removed = before - buckets.len();
        if removed > 0 {
            debug!(removed = removed, remaining = buckets.len(), "Swept idle buckets");
        }
        removed
    }

    /// Spawn a task that calls [`sweep_idle`](Self::sweep_idle) every `interval`.
    ///
    /// Must be called from within a tokio runtime. The task runs until the
    /// handle is aborted.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_idle: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_idle(clock.now_ms(), max_idle);
            }
        })
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.write().clear();
    }

    /// Get the number of tracked buckets.
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Whether no buckets are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }
}

#[async_trait]
impl RateLimiterBackend for LocalBucketStore {
    async fn allow(&self, key: &str, now_ms: u64) -> Decision {
        LocalBucketStore::allow(self, key, now_ms)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    const T0: u64 = 1_700_000_000_000;

    fn store(rate: f64, capacity: u32) -> LocalBucketStore {
        LocalBucketStore::new(BucketLimits::new(rate, capacity))
    }

    #[test]
    fn test_store_creation() {
        let store = store(1.0, 1);
        assert!(store.is_empty());
        assert_eq!(store.tokens("missing"), None);
    }

    #[test]
    fn test_burst_cap() {
        let store = store(1.0, 1);

        assert_eq!(store.allow("k", T0), Decision::Allow);
        assert_eq!(store.allow("k", T0), Decision::Deny);
    }

    #[test]
    fn test_exact_burst_count() {
        let store = store(1.0, 5);

        for i in 1..=5 {
            assert_eq!(store.allow("k", T0), Decision::Allow, "Request {} should be allowed", i);
        }
        assert_eq!(store.allow("k", T0), Decision::Deny);
    }

    #[test]
    fn test_capacity_ceiling_after_long_idle() {
        let store = store(10.0, 3);
        for _ in 0..3 {
            store.allow("k", T0);
        }

        // A day idle refills far more than capacity worth of tokens
        let later = T0 + 86_400_000;
        for _ in 0..3 {
            assert_eq!(store.allow("k", later), Decision::Allow);
        }
        assert_eq!(store.allow("k", later), Decision::Deny);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = store(1.0, 2);

        assert!(store.allow("10.0.0.1", T0).is_allowed());
        assert!(store.allow("10.0.0.1", T0).is_allowed());
        assert!(!store.allow("10.0.0.1", T0).is_allowed());

        assert!(store.allow("10.0.0.2", T0).is_allowed());
        assert!(store.allow("10.0.0.2", T0).is_allowed());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_tokens_snapshot() {
        let store = store(1.0, 4);
        store.allow("k", T0);
        assert_eq!(store.tokens("k"), Some(3.0));
    }

    #[test]
    fn test_sweep_idle_only_removes_stale_buckets() {
        let store = store(1.0, 1);
        store.allow("old", T0);
        store.allow("fresh", T0 + 50_000);

        let removed = store.sweep_idle(T0 + 60_000, Duration::from_secs(30));

        assert_eq!(removed, 1);
        assert_eq!(store.tokens("old"), None);
        assert!(store.tokens("fresh").is_some());
    }

    #[test]
    fn test_sweep_keeps_partially_refilled_bucket() {
        // 0.1 tokens/s: an emptied bucket needs 20 seconds to refill.
        let store = store(0.1, 2);
        assert!(store.allow("k", T0).is_allowed());
        assert!(store.allow("k", T0).is_allowed());
        assert!(!store.allow("k", T0).is_allowed());

        let removed = store.sweep_idle(T0 + 2_000, Duration::from_secs(1));
        assert_eq!(removed, 0);

        // Only 0.2 tokens earned since the bucket ran dry.
        let admitted = (0..5)
            .filter(|_| store.allow("k", T0 + 2_000).is_allowed())
            .count();
        assert_eq!(admitted, 0);
    }

    #[test]
    fn test_sweep_does_not_change_decisions() {
        let store = store(0.1, 2);
        store.allow("k", T0);
        store.allow("k", T0);

        // Still short of capacity well past the idle window.
        assert_eq!(store.sweep_idle(T0 + 15_000, Duration::from_secs(1)), 0);
        assert!(store.allow("k", T0 + 15_000).is_allowed());
        assert!(!store.allow("k", T0 + 15_000).is_allowed());

        // Refilled to capacity by now, so dropping it changes nothing.
        assert_eq!(store.sweep_idle(T0 + 35_000, Duration::from_secs(1)), 1);
        assert!(store.allow("k", T0 + 35_000).is_allowed());
        assert!(store.allow("k", T0 + 35_000).is_allowed());
        assert!(!store.allow("k", T0 + 35_000).is_allowed());
    }

    #[test]
    fn test_swept_bucket_held_by_caller_is_not_spent() {
        let store = store(1.0, 2);
        store.allow("k", T0);

        // A caller that looked the bucket up before the sweep still holds it.
        let held = store.bucket("k", T0);
        assert_eq!(store.sweep_idle(T0 + 60_000, Duration::from_secs(30)), 1);
        assert!(held.lock().evicted);

        // Other callers recreate the key and drain the fresh bucket.
        assert!(store.allow("k", T0 + 60_000).is_allowed());
        assert!(store.allow("k", T0 + 60_000).is_allowed());

        // The evicted slot keeps its stale count and is never consulted again.
        assert!(!store.allow("k", T0 + 60_000).is_allowed());
        assert_eq!(held.lock().state.tokens(), 1.0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_allow_and_sweep_never_overspend() {
        for _round in 0..50 {
            let store = Arc::new(store(1.0, 4));
            // Refilled and idle at `now`, so every sweep may drop it.
            store.allow("shared", T0);
            let now = T0 + 60_000;

            let sweeper = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        store.sweep_idle(now, Duration::from_secs(30));
                    }
                })
            };

            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let store = Arc::clone(&store);
                    std::thread::spawn(move || store.allow("shared", now).is_allowed())
                })
                .collect();

            let allowed = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|allowed| *allowed)
                .count();
            sweeper.join().unwrap();

            assert_eq!(allowed, 4);
        }
    }

    #[test]
    fn test_clear_buckets() {
        let store = store(1.0, 1);
        store.allow("k", T0);
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_threads_never_overspend() {
        let store = Arc::new(store(0.001, 25));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.allow("shared", T0).is_allowed())
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 25);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_removes_idle_buckets() {
        let clock = ManualClock::new(T0);
        let store = Arc::new(store(1.0, 1));
        store.allow("k", T0);

        let handle = Arc::clone(&store).spawn_sweeper(
            Arc::new(clock.clone()),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );

        clock.advance(Duration::from_secs(11));
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert!(store.is_empty());
        handle.abort();
    }
}
