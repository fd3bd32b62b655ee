//! Layered configuration loading.

use std::path::{Path, PathBuf};

use tracing::info;

use super::FloodgateConfig;
use crate::error::{FloodgateError, Result};

/// Environment variable prefix used unless overridden.
pub const DEFAULT_ENV_PREFIX: &str = "FLOODGATE";

/// Loads configuration from built-in defaults, an optional file and the
/// environment, in increasing order of precedence.
///
/// Environment keys use `__` between path segments, so
/// `FLOODGATE__RATE_LIMIT__CAPACITY=20` sets `rate_limit.capacity`.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a loader with no config file and the `FLOODGATE` prefix.
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
        }
    }

    /// Set config file path. The format follows the file extension.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Set environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load and validate configuration.
    ///
    /// A config path that was set explicitly must exist.
    pub fn load(&self) -> Result<FloodgateConfig> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            include_str!("defaults.toml"),
            config::FileFormat::Toml,
        ));

        if let Some(path) = &self.config_path {
            info!(path = %path.display(), "Loading config file");
            builder = builder.add_source(config::File::from(Path::new(path)).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: FloodgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FloodgateError::Config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{FailureMode, KeyExtractor};

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("floodgate-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_only() {
        let config = ConfigLoader::new()
            .with_env_prefix("FLOODGATE_LOADER_DEFAULTS")
            .load()
            .unwrap();

        assert_eq!(config.rate_limit.rate, 10.0);
        assert_eq!(config.rate_limit.capacity, 10);
        assert!(matches!(config.rate_limit.key, KeyExtractor::Global));
        assert_eq!(config.rate_limit.ttl_secs, 60);
        assert_eq!(config.rate_limit.store_timeout_ms, 50);
        assert_eq!(config.rate_limit.failure_mode, FailureMode::Open);
        assert!(config.rate_limit.idle_timeout_secs.is_none());
        assert!(config.store.redis_url.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let path = temp_file(
            "override.yaml",
            "rate_limit:\n  rate: 2.5\n  capacity: 7\n  key: \"header:x-api-key\"\n",
        );

        let config = ConfigLoader::new()
            .with_config_path(&path)
            .with_env_prefix("FLOODGATE_LOADER_FILE")
            .load()
            .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.rate_limit.rate, 2.5);
        assert_eq!(config.rate_limit.capacity, 7);
        assert!(matches!(config.rate_limit.key, KeyExtractor::Header(ref h) if h == "x-api-key"));
        // Untouched fields keep their defaults.
        assert_eq!(config.rate_limit.key_prefix, "floodgate:");
    }

    #[test]
    fn test_environment_overrides_file() {
        let path = temp_file("env.yaml", "rate_limit:\n  rate: 1.0\n  capacity: 3\n");
        std::env::set_var("FLOODGATE_LOADER_ENV__RATE_LIMIT__CAPACITY", "25");
        std::env::set_var("FLOODGATE_LOADER_ENV__LOGGING__JSON", "true");

        let config = ConfigLoader::new()
            .with_config_path(&path)
            .with_env_prefix("FLOODGATE_LOADER_ENV")
            .load()
            .unwrap();
        std::fs::remove_file(&path).ok();
        std::env::remove_var("FLOODGATE_LOADER_ENV__RATE_LIMIT__CAPACITY");
        std::env::remove_var("FLOODGATE_LOADER_ENV__LOGGING__JSON");

        assert_eq!(config.rate_limit.rate, 1.0);
        assert_eq!(config.rate_limit.capacity, 25);
        assert!(config.logging.json);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = ConfigLoader::new()
            .with_config_path("/nonexistent/floodgate.yaml")
            .with_env_prefix("FLOODGATE_LOADER_MISSING")
            .load();

        assert!(matches!(result, Err(FloodgateError::Config(_))));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let path = temp_file("invalid.yaml", "rate_limit:\n  rate: 0.0\n  capacity: 3\n");

        let result = ConfigLoader::new()
            .with_config_path(&path)
            .with_env_prefix("FLOODGATE_LOADER_INVALID")
            .load();
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }
}
