//! Backend trait for abstracting local and distributed bucket stores.

use async_trait::async_trait;
use serde::Serialize;

/// The outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// Admit the request
    Allow,
    /// Reject the request
    Deny,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl From<bool> for Decision {
    fn from(allowed: bool) -> Self {
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

/// Which kind of store backs a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process buckets
    Local,
    /// Buckets held in a shared coordination store
    Distributed,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Distributed => write!(f, "distributed"),
        }
    }
}

/// Trait for bucket store implementations.
///
/// This trait abstracts over the in-process `LocalBucketStore` and the
/// store-backed `DistributedBucketStore` so the `RateLimiter` facade can
/// hold either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Refill and try to consume one token from the bucket for `key`.
    async fn allow(&self, key: &str, now_ms: u64) -> Decision;

    /// The kind of backend.
    fn kind(&self) -> BackendKind;
}
