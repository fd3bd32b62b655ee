//! Rate limit configuration and validation.
//!
//! A `RateLimitConfig` describes one limiter: its refill rate, burst
//! capacity, how requests map to buckets, and how the distributed backend
//! names, expires and times out its shared state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::bucket::BucketLimits;
use super::key::KeyExtractor;
use crate::error::{FloodgateError, Result};

/// What the distributed backend decides when the coordination store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit requests while the store is unavailable
    #[default]
    Open,
    /// Reject requests while the store is unavailable
    Closed,
}

/// Configuration for one rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tokens added per second
    pub rate: f64,
    /// Maximum tokens a bucket can hold (the burst size)
    pub capacity: u32,
    /// How requests map to partition keys
    #[serde(default)]
    pub key: KeyExtractor,
    /// Namespace for keys in the coordination store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Idle expiry for keys in the coordination store
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Bound on one coordination store round trip
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    /// Decision used when the coordination store fails
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Local buckets idle this long may be swept; `None` keeps them forever
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_key_prefix() -> String {
    "floodgate:".to_string()
}

fn default_ttl_secs() -> u64 {
    60
}

fn default_store_timeout_ms() -> u64 {
    50
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(10.0, 10)
    }
}

impl RateLimitConfig {
    /// Create a configuration with the given rate and capacity and default
    /// settings for everything else.
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            rate,
            capacity,
            key: KeyExtractor::default(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            failure_mode: FailureMode::default(),
            idle_timeout_secs: None,
        }
    }

    /// Set the key extraction strategy.
    pub fn with_key(mut self, key: KeyExtractor) -> Self {
        self.key = key;
        self
    }

    /// Set the coordination store key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the coordination store key expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs();
        self
    }

    /// Set the coordination store round-trip timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the failure mode.
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Enable the idle sweep for local buckets.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout_secs = Some(idle.as_secs());
        self
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateLimitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rate limit config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot describe a working limiter.
    ///
    /// A capacity below one is a misconfiguration, not an "always deny" policy.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(FloodgateError::Config(format!(
                "rate must be a positive number of tokens per second, got {}",
                self.rate
            )));
        }

        if self.capacity < 1 {
            return Err(FloodgateError::Config(
                "capacity must be at least 1".to_string(),
            ));
        }

        if self.ttl_secs == 0 {
            return Err(FloodgateError::Config(
                "ttl_secs must be greater than 0".to_string(),
            ));
        }

        if self.store_timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "store_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.idle_timeout_secs == Some(0) {
            return Err(FloodgateError::Config(
                "idle_timeout_secs must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Refill parameters for buckets under this configuration.
    pub fn limits(&self) -> BucketLimits {
        BucketLimits::new(self.rate, self.capacity)
    }

    /// Coordination store key expiry.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Coordination store round-trip timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Idle window after which local buckets may be swept.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}
