//! Floodgate - Token Bucket Admission Control
//!
//! This crate decides, per incoming request, whether to admit or reject it
//! based on a token-bucket budget. Budgets are either held in-process or
//! shared across a fleet of instances through a Redis coordination store,
//! where the refill/consume step runs as a single server-side script.

pub mod config;
pub mod error;
pub mod middleware;
pub mod ratelimit;
pub mod store;

pub use error::{FloodgateError, Result};
pub use ratelimit::{Decision, KeyExtractor, RateLimitConfig, RateLimiter};
