//! Rate limit rules configuration.
//!
//! Rules are loaded once at startup from YAML and never change afterwards.
//! Both a bare `name -> rule` map and a document with a top-level `rules`
//! key are accepted:
//!
//! ```yaml
//! rules:
//!   login:
//!     max_tokens: 5
//!     refill_rate: 5.0
//!   provider_callback:
//!     max_tokens: 20
//!     refill_rate: 10.0
//!     cost: 2
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::bucket::{refill_secs, TokenBucketParams, MAX_EXPIRY_SECS};
use crate::error::{BucketgateError, Result};

/// A token bucket policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Bucket capacity
    pub max_tokens: u32,
    /// Tokens added per 60-second interval
    pub refill_rate: f64,
    /// Tokens consumed by a request that does not specify its own cost
    #[serde(default = "default_cost")]
    pub cost: u32,
}

fn default_cost() -> u32 {
    1
}

impl RateLimitRule {
    /// Create a rule with the default cost of one token.
    pub fn new(max_tokens: u32, refill_rate: f64) -> Self {
        Self {
            max_tokens,
            refill_rate,
            cost: default_cost(),
        }
    }

    /// Override the default cost.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// Check the rule's parameters.
    pub fn validate(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(BucketgateError::Config("rule name must not be empty".to_string()));
        }
        if self.max_tokens == 0 {
            return Err(BucketgateError::Config(format!(
                "rule {name}: max_tokens must be greater than zero"
            )));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(BucketgateError::Config(format!(
                "rule {name}: refill_rate must be a positive number, got {}",
                self.refill_rate
            )));
        }
        if refill_secs(self.max_tokens, self.refill_rate) > MAX_EXPIRY_SECS as f64 {
            return Err(BucketgateError::Config(format!(
                "rule {name}: refilling {} tokens at {}/min takes longer than {} seconds",
                self.max_tokens, self.refill_rate, MAX_EXPIRY_SECS
            )));
        }
        if self.cost == 0 {
            return Err(BucketgateError::Config(format!(
                "rule {name}: cost must be greater than zero"
            )));
        }
        if self.cost > self.max_tokens {
            return Err(BucketgateError::Config(format!(
                "rule {name}: cost {} exceeds max_tokens {}",
                self.cost, self.max_tokens
            )));
        }
        Ok(())
    }

    /// Bucket parameters for a request of the given cost.
    pub fn params(&self, cost: u32) -> TokenBucketParams {
        TokenBucketParams {
            max_tokens: self.max_tokens,
            refill_rate: self.refill_rate,
            cost,
        }
    }
}

/// The immutable table of named rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleSet {
    rules: BTreeMap<String, RateLimitRule>,
}

#[derive(Deserialize)]
struct RulesDocument {
    rules: RuleSet,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, validating it first. Intended for startup wiring.
    pub fn with_rule(mut self, name: impl Into<String>, rule: RateLimitRule) -> Result<Self> {
        let name = name.into();
        rule.validate(&name)?;
        self.rules.insert(name, rule);
        Ok(self)
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules = match serde_yaml::from_str::<RulesDocument>(yaml) {
            Ok(document) => document.rules,
            Err(document_err) => match serde_yaml::from_str::<RuleSet>(yaml) {
                Ok(rules) => rules,
                // Report the failure for the shape the document was written in.
                Err(bare_err) => {
                    let err = if has_rules_key(yaml) {
                        document_err
                    } else {
                        bare_err
                    };
                    return Err(BucketgateError::Config(format!(
                        "Failed to parse rate limit rules: {}",
                        err
                    )));
                }
            },
        };

        rules.validate()?;
        info!(count = rules.len(), "Rate limit rules loaded");
        Ok(rules)
    }

    /// Validate every rule in the set.
    pub fn validate(&self) -> Result<()> {
        self.rules
            .iter()
            .try_for_each(|(name, rule)| rule.validate(name))
    }

    /// Look up a rule by name.
    pub fn get(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.get(name)
    }

    /// Iterate over rules in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RateLimitRule)> {
        self.rules.iter().map(|(name, rule)| (name.as_str(), rule))
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn has_rules_key(yaml: &str) -> bool {
    serde_yaml::from_str::<serde_yaml::Value>(yaml)
        .map(|value| value.get("rules").is_some())
        .unwrap_or(false)
}
