//! Coordination stores for shared token buckets.
//!
//! A coordination store holds bucket state that several service instances
//! read and update. The refill/consume transition runs inside the store as
//! one indivisible step, so concurrent callers from different processes can
//! never spend the same token twice.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur talking to a coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection or command failure reported by the Redis client
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// The store did not answer within the configured bound
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
    /// The store answered with something the transition cannot produce
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
    /// The store refused the call outright
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// One refill/consume transition to be executed by the store.
#[derive(Debug, Clone, Copy)]
pub struct BucketRequest<'a> {
    /// Fully qualified store key (prefix included)
    pub key: &'a str,
    /// Maximum tokens the bucket can hold
    pub capacity: u32,
    /// Tokens added per second
    pub rate: f64,
    /// Caller's current time in milliseconds since the epoch
    pub now_ms: u64,
    /// Expiry applied to the key after this access
    pub ttl: Duration,
}

/// A store able to run the token bucket transition atomically.
///
/// Implementations must treat a key with no state as a full bucket
/// observed at `now_ms`, and must refresh the key's expiry to `ttl` on
/// every call whatever the outcome.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Refill the bucket and try to take one token.
    ///
    /// Returns `Ok(true)` if a token was taken.
    async fn acquire(&self, request: &BucketRequest<'_>) -> Result<bool, StoreError>;
}
