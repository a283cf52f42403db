//! Configuration management for Bucketgate.
//!
//! The store section is read through the `config` crate so any field can be
//! overridden from the environment (`BUCKETGATE__STORE__URL`,
//! `BUCKETGATE__STORE__TIMEOUT_MS`, ...). Rules come from the same YAML
//! document's `rules` key, or from a separate file named by `rules_path`.
//! Rules are read once; changing them requires a restart.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{BucketgateError, Result};
use crate::ratelimit::RuleSet;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "BUCKETGATE";

/// Main configuration for the Bucketgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketgateConfig {
    /// Bucket store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Optional path to a separate rules file
    #[serde(default)]
    pub rules_path: Option<String>,

    /// Loaded rate limit rules
    #[serde(default)]
    pub rules: RuleSet,
}

/// Which bucket store to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, not shared between instances
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// Bucket store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, required for `redis`
    #[serde(default)]
    pub url: Option<String>,

    /// Namespace prepended to every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each store round-trip in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    "bucketgate".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    /// Store call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check settings that depend on each other.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(BucketgateError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.backend == StoreBackend::Redis && self.url.as_deref().map_or(true, str::is_empty) {
            return Err(BucketgateError::Config(
                "store.url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }
}

/// Keys the `config` crate sees; rules are parsed separately so rule names
/// keep their exact spelling.
#[derive(Deserialize)]
struct Settings {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    rules_path: Option<String>,
}

impl BucketgateConfig {
    /// Load configuration from a YAML file, applying environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        info!(path = %path, "Loading configuration");

        let settings: Settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BucketgateError::Config(e.to_string()))?;

        let contents = std::fs::read_to_string(path)?;
        let base = Path::new(path).parent().unwrap_or_else(|| Path::new("."));
        let rules = Self::load_rules(&contents, settings.rules_path.as_deref(), base)?;

        let config = Self {
            store: settings.store,
            rules_path: settings.rules_path,
            rules,
        };
        config.store.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    ///
    /// A relative `rules_path` is resolved against the working directory.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(yaml)
            .map_err(|e| BucketgateError::Config(e.to_string()))?;
        let rules = Self::load_rules(yaml, settings.rules_path.as_deref(), Path::new("."))?;

        let config = Self {
            store: settings.store,
            rules_path: settings.rules_path,
            rules,
        };
        config.store.validate()?;
        Ok(config)
    }

    fn load_rules(document: &str, rules_path: Option<&str>, base: &Path) -> Result<RuleSet> {
        match rules_path {
            Some(rules_path) => RuleSet::from_file(base.join(rules_path)),
            None => {
                #[derive(Deserialize)]
                struct Inline {
                    #[serde(default)]
                    rules: Option<serde_yaml::Value>,
                }

                let inline: Inline = serde_yaml::from_str(document)
                    .map_err(|e| BucketgateError::Config(e.to_string()))?;
                match inline.rules {
                    Some(rules) => {
                        let rules: RuleSet = serde_yaml::from_value(rules).map_err(|e| {
                            BucketgateError::Config(format!(
                                "Failed to parse rate limit rules: {}",
                                e
                            ))
                        })?;
                        rules.validate()?;
                        info!(count = rules.len(), "Rate limit rules loaded");
                        Ok(rules)
                    }
                    None => Err(BucketgateError::Config(
                        "no rules configured: set `rules` or `rules_path`".to_string(),
                    )),
                }
            }
        }
    }
}
