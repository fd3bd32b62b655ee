//! Token buckets held in a shared coordination store.
//!
//! Every instance pointed at the same store and key prefix shares the same
//! budgets. The store runs the refill/consume transition itself; this side
//! only supplies the parameters, bounds the round trip, and applies the
//! failure policy when the store cannot answer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::backend::{BackendKind, Decision, RateLimiterBackend};
use super::policy::{FailureMode, RateLimitConfig};
use crate::store::{BucketRequest, CoordinationStore, StoreError};

/// Token buckets backed by a [`CoordinationStore`].
pub struct DistributedBucketStore {
    /// The shared store
    store: Arc<dyn CoordinationStore>,
    /// Namespace prepended to every key
    key_prefix: String,
    /// Maximum tokens per bucket
    capacity: u32,
    /// Tokens added per second
    rate: f64,
    /// Idle expiry refreshed on every access
    ttl: Duration,
    /// Bound on one store round trip
    timeout: Duration,
    /// Decision when the store fails
    failure_mode: FailureMode,
}

impl fmt::Debug for DistributedBucketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedBucketStore")
            .field("key_prefix", &self.key_prefix)
            .field("capacity", &self.capacity)
            .field("rate", &self.rate)
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .field("failure_mode", &self.failure_mode)
            .finish_non_exhaustive()
    }
}

impl DistributedBucketStore {
    /// Create a distributed store from a limiter configuration.
    pub fn new(store: Arc<dyn CoordinationStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            key_prefix: config.key_prefix.clone(),
            capacity: config.capacity,
            rate: config.rate,
            ttl: config.ttl(),
            timeout: config.store_timeout(),
            failure_mode: config.failure_mode,
        }
    }

    /// The key used in the coordination store for a partition key.
    pub fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Refill and try to consume one token from the shared bucket for `key`.
    ///
    /// Never returns an error: a store failure or timeout resolves to the
    /// configured failure mode. Dropping the returned future abandons the
    /// in-flight store call.
    pub async fn allow(&self, key: &str, now_ms: u64) -> Decision {
        let store_key = self.store_key(key);
        let request = BucketRequest {
            key: &store_key,
            capacity: self.capacity,
            rate: self.rate,
            now_ms,
            ttl: self.ttl,
        };

        let outcome = match tokio::time::timeout(self.timeout, self.store.acquire(&request)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        match outcome {
            Ok(allowed) => {
                trace!(key = %store_key, allowed = allowed, "Distributed bucket checked");
                if !allowed {
                    debug!(key = %store_key, "Distributed rate limit exceeded");
                }
                Decision::from(allowed)
            }
            Err(error) => self.on_store_failure(&store_key, &error),
        }
    }

    fn on_store_failure(&self, store_key: &str, error: &StoreError) -> Decision {
        let decision = match self.failure_mode {
            FailureMode::Open => Decision::Allow,
            FailureMode::Closed => Decision::Deny,
        };

        warn!(
            key = %store_key,
            error = %error,
            failure_mode = ?self.failure_mode,
            decision = ?decision,
            "Coordination store unavailable, applying failure mode"
        );

        decision
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedBucketStore {
    async fn allow(&self, key: &str, now_ms: u64) -> Decision {
        DistributedBucketStore::allow(self, key, now_ms).await
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }
}
