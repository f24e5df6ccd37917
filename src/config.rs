//! Configuration management for tokenguard.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::hash::Hash;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TokenGuardError};
use crate::ratelimit::{validate_parameters, Clock, KeyedBuckets, MonotonicClock, TokenBucket};

/// Main configuration for tokenguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenGuardConfig {
    /// Token bucket parameters
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-key bucket registry configuration
    #[serde(default)]
    pub keyed: KeyedConfig,
}

/// Parameters for a single token bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Tokens added per second
    #[serde(default = "default_rate")]
    pub rate: f64,

    /// Maximum number of tokens the bucket can hold
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Starting token count; the bucket starts full when unset
    #[serde(default)]
    pub initial_tokens: Option<f64>,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            capacity: default_capacity(),
            initial_tokens: None,
        }
    }
}

fn default_rate() -> f64 {
    2.0
}

fn default_capacity() -> f64 {
    10.0
}

impl BucketConfig {
    /// Create a bucket configuration that starts full.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            initial_tokens: None,
        }
    }

    /// Check that the parameters describe a valid bucket.
    pub fn validate(&self) -> Result<()> {
        validate_parameters(self.rate, self.capacity, self.initial_tokens)
    }

    /// Build a bucket driven by the monotonic clock.
    pub fn build(&self) -> Result<TokenBucket> {
        self.build_with_clock(MonotonicClock)
    }

    /// Build a bucket driven by `clock`.
    pub fn build_with_clock<C: Clock>(&self, clock: C) -> Result<TokenBucket<C>> {
        TokenBucket::with_clock(self.rate, self.capacity, self.initial_tokens, clock)
    }
}

/// Configuration for a registry of per-key buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyedConfig {
    /// Parameters each per-key bucket is created with
    #[serde(default)]
    pub template: BucketConfig,
}

impl KeyedConfig {
    /// Check that the template describes a valid bucket.
    pub fn validate(&self) -> Result<()> {
        self.template.validate()
    }

    /// Build a registry whose buckets use the monotonic clock.
    pub fn build<K>(&self) -> Result<KeyedBuckets<K>>
    where
        K: Eq + Hash + Clone + Display,
    {
        KeyedBuckets::new(self.template.clone())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON formatted logs
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

impl TokenGuardConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    ///
    /// The bucket parameters and the keyed template are validated before
    /// returning.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TokenGuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TokenGuardError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.bucket.validate()?;
        config.keyed.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TokenGuardConfig::default();
        assert_eq!(config.bucket.rate, 2.0);
        assert_eq!(config.bucket.capacity, 10.0);
        assert_eq!(config.bucket.initial_tokens, None);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.keyed.template, BucketConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
bucket:
  rate: 5
  capacity: 20
  initial_tokens: 7.5
logging:
  level: debug
  json: true
"#;
        let config = TokenGuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.bucket.rate, 5.0);
        assert_eq!(config.bucket.capacity, 20.0);
        assert_eq!(config.bucket.initial_tokens, Some(7.5));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
bucket:
  capacity: 50
"#;
        let config = TokenGuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.bucket.rate, 2.0);
        assert_eq!(config.bucket.capacity, 50.0);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_keyed_config() {
        let yaml = r#"
keyed:
  template:
    rate: 1.5
    capacity: 3
    initial_tokens: 0
"#;
        let config = TokenGuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.keyed.template.rate, 1.5);
        assert_eq!(config.keyed.template.capacity, 3.0);
        assert_eq!(config.keyed.template.initial_tokens, Some(0.0));
        // The single bucket keeps its defaults
        assert_eq!(config.bucket, BucketConfig::default());

        let registry = config.keyed.build::<String>().unwrap();
        let key = "client".to_string();
        assert!(!registry.allow(&key, 1.0));
        assert_eq!(registry.template().capacity, 3.0);
    }

    #[test]
    fn test_partial_keyed_template_uses_defaults() {
        let yaml = r#"
keyed:
  template:
    capacity: 4
"#;
        let config = TokenGuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.keyed.template.rate, 2.0);
        assert_eq!(config.keyed.template.capacity, 4.0);
    }

    #[test]
    fn test_invalid_keyed_template_rejected() {
        let yaml = r#"
keyed:
  template:
    rate: 1
    capacity: 2
    initial_tokens: 5
"#;
        let result = TokenGuardConfig::from_yaml(yaml);
        assert!(matches!(
            result,
            Err(TokenGuardError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_invalid_bucket_rejected() {
        let yaml = r#"
bucket:
  rate: 0
  capacity: 10
"#;
        let result = TokenGuardConfig::from_yaml(yaml);
        assert!(matches!(
            result,
            Err(TokenGuardError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let result = TokenGuardConfig::from_yaml("bucket: [not, a, map");
        assert!(matches!(result, Err(TokenGuardError::Config(_))));
    }

    #[test]
    fn test_build_bucket_from_config() {
        let config = BucketConfig {
            rate: 1.0,
            capacity: 4.0,
            initial_tokens: Some(1.0),
        };
        let bucket = config.build().unwrap();
        assert_eq!(bucket.capacity(), 4.0);
        assert!(bucket.allow(1.0));
        assert!(!bucket.allow(1.0));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir()
            .join(format!("tokenguard-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "bucket:\n  rate: 3\n  capacity: 6\n").unwrap();

        let config = TokenGuardConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.bucket, BucketConfig::new(3.0, 6.0));
    }

    #[test]
    fn test_from_missing_file() {
        let result = TokenGuardConfig::from_file("/nonexistent/tokenguard.yaml");
        assert!(matches!(result, Err(TokenGuardError::Io(_))));
    }
}
