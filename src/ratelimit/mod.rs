//! Token bucket rate limiting.

mod backend;
mod bucket;
mod distributed;
mod key;
mod limiter;
mod local;
mod policy;

pub mod clock;

pub use backend::{BackendKind, Decision, RateLimiterBackend};
pub use bucket::{BucketLimits, BucketState};
pub use distributed::DistributedBucketStore;
pub use key::{AuthenticatedClient, ClientAddr, KeyExtractor, KeyFn, RequestView, GLOBAL_KEY};
pub use limiter::RateLimiter;
pub use local::LocalBucketStore;
pub use policy::{FailureMode, RateLimitConfig};
