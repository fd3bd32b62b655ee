//! The rate limiter facade.

use std::sync::Arc;
use std::time::Duration;

use http::Request;
use tokio::task::JoinHandle;
use tracing::{info, trace};

use super::backend::{BackendKind, Decision, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::distributed::DistributedBucketStore;
use super::local::LocalBucketStore;
use super::policy::RateLimitConfig;
use crate::error::Result;
use crate::store::CoordinationStore;

/// Which store a limiter consults, fixed at construction.
enum Backend {
    Local(Arc<LocalBucketStore>),
    Distributed(DistributedBucketStore),
}

impl Backend {
    fn as_backend(&self) -> &dyn RateLimiterBackend {
        match self {
            Backend::Local(store) => store.as_ref(),
            Backend::Distributed(store) => store,
        }
    }
}

/// Admission control for one configured budget.
///
/// The limiter validates its configuration on construction, picks the
/// local or distributed backend once, and then answers one question per
/// request: allow or deny. It is thread-safe and meant to be shared
/// behind an `Arc`.
pub struct RateLimiter {
    config: RateLimitConfig,
    backend: Backend,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("backend", &self.backend_kind())
            .field("clock", &self.clock)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter.
    ///
    /// With a coordination store the limiter uses distributed buckets;
    /// without one it keeps buckets in process memory.
    ///
    /// # Errors
    /// Returns a configuration error if `rate` is not positive, `capacity`
    /// is zero, or a timeout/expiry setting is zero.
    pub fn new(config: RateLimitConfig, store: Option<Arc<dyn CoordinationStore>>) -> Result<Self> {
        config.validate()?;

        let backend = match store {
            Some(store) => Backend::Distributed(DistributedBucketStore::new(store, &config)),
            None => Backend::Local(Arc::new(LocalBucketStore::new(config.limits()))),
        };

        info!(
            backend = %backend.as_backend().kind(),
            rate = config.rate,
            capacity = config.capacity,
            key = ?config.key,
            "Rate limiter initialized"
        );

        Ok(Self {
            config,
            backend,
            clock: Arc::new(SystemClock::new()),
        })
    }

    /// Create a rate limiter with in-process buckets.
    pub fn local(config: RateLimitConfig) -> Result<Self> {
        Self::new(config, None)
    }

    /// Create a rate limiter with buckets in a shared coordination store.
    pub fn distributed(config: RateLimitConfig, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        Self::new(config, Some(store))
    }

    /// Replace the clock used to timestamp decisions.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Decide whether a request may proceed.
    ///
    /// Applies the configured key extractor and consumes one token from the
    /// resulting bucket.
    pub async fn decide<B>(&self, req: &Request<B>) -> Decision {
        let key = self.partition_key(req);
        self.decide_key(&key, self.now_ms()).await
    }

    /// The partition key the configured extractor derives for a request.
    pub fn partition_key<B>(&self, req: &Request<B>) -> String {
        self.config.key.extract(req)
    }

    /// The limiter clock's current time in milliseconds since the epoch.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Decide for an explicit partition key and timestamp.
    pub async fn decide_key(&self, key: &str, now_ms: u64) -> Decision {
        let decision = self.backend.as_backend().allow(key, now_ms).await;
        trace!(key = %key, decision = ?decision, "Admission decision made");
        decision
    }

    /// The backend chosen at construction.
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.as_backend().kind()
    }

    /// The limiter's configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The local bucket store, if this limiter uses one.
    pub fn local_store(&self) -> Option<&LocalBucketStore> {
        match &self.backend {
            Backend::Local(store) => Some(store.as_ref()),
            Backend::Distributed(_) => None,
        }
    }

    /// Start sweeping idle local buckets every `interval`.
    ///
    /// Returns `None` for the distributed backend (the store's TTL already
    /// bounds its memory) or when no idle timeout is configured. Must be
    /// called from within a tokio runtime.
    pub fn spawn_idle_sweeper(&self, interval: Duration) -> Option<JoinHandle<()>> {
        let idle = self.config.idle_timeout()?;
        match &self.backend {
            Backend::Local(store) => {
                info!(interval = ?interval, idle = ?idle, "Starting idle bucket sweeper");
                Some(Arc::clone(store).spawn_sweeper(Arc::clone(&self.clock), interval, idle))
            }
            Backend::Distributed(_) => None,
        }
    }
}
