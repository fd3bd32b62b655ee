//! Configuration management for Floodgate.

mod loader;

pub use loader::ConfigLoader;

use std::path::Path;
use std::sync::Arc;

use redis::IntoConnectionInfo;
use serde::{Deserialize, Serialize};

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{RateLimitConfig, RateLimiter};
use crate::store::{CoordinationStore, RedisStore};

/// Top-level configuration for a Floodgate deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Token bucket settings
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Coordination store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Coordination store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL; when set, budgets are shared through Redis
    #[serde(default)]
    pub redis_url: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.rate_limit.validate()?;

        if let Some(url) = &self.store.redis_url {
            url.as_str().into_connection_info().map_err(|e| {
                FloodgateError::Config(format!("invalid store.redis_url: {}", e))
            })?;
        }

        if self.logging.level.trim().is_empty() {
            return Err(FloodgateError::Config(
                "logging.level must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Build the limiter this configuration describes.
    ///
    /// A configured Redis URL selects the distributed backend. The
    /// connection is opened on first use, so an unreachable server does not
    /// fail construction.
    pub fn build_limiter(&self) -> Result<RateLimiter> {
        let store = match &self.store.redis_url {
            Some(url) => Some(Arc::new(RedisStore::new(url)?) as Arc<dyn CoordinationStore>),
            None => None,
        };

        RateLimiter::new(self.rate_limit.clone(), store)
    }
}
