//! Bucket key derivation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BucketgateError, Result};

/// The identity dimension a limit is enforced against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScopeType {
    /// Client IP address
    Ip,
    /// Authenticated user id
    User,
    /// Endpoint or route
    Endpoint,
    /// Identity provider
    Provider,
    /// User within an identity provider
    ProviderUser,
    /// Any other lowercase `[a-z0-9_]+` scope
    Custom(String),
}

impl ScopeType {
    /// Wire name of this scope.
    pub fn as_str(&self) -> &str {
        match self {
            ScopeType::Ip => "ip",
            ScopeType::User => "user",
            ScopeType::Endpoint => "endpoint",
            ScopeType::Provider => "provider",
            ScopeType::ProviderUser => "provider_user",
            ScopeType::Custom(name) => name,
        }
    }
}

impl FromStr for ScopeType {
    type Err = BucketgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(ScopeType::Ip),
            "user" => Ok(ScopeType::User),
            "endpoint" => Ok(ScopeType::Endpoint),
            "provider" => Ok(ScopeType::Provider),
            "provider_user" => Ok(ScopeType::ProviderUser),
            "" => Err(BucketgateError::Validation(
                "scope type must not be empty".to_string(),
            )),
            other => {
                let valid = other
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
                if valid {
                    Ok(ScopeType::Custom(other.to_string()))
                } else {
                    Err(BucketgateError::Validation(format!(
                        "scope type {other:?} must match [a-z0-9_]+"
                    )))
                }
            }
        }
    }
}

impl TryFrom<String> for ScopeType {
    type Error = BucketgateError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ScopeType> for String {
    fn from(scope: ScopeType) -> Self {
        scope.as_str().to_string()
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies one logical bucket.
///
/// Each component is written as `<byte length>:<bytes>` and components are
/// joined with `|`. Because every component carries its own length, a scope
/// value containing `|` or `:` cannot be read as a different split.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    scope_type: ScopeType,
    scope_value: String,
    rule_name: String,
    encoded: String,
}

impl BucketKey {
    /// Derive the key for a scope and rule.
    pub fn derive(scope_type: &str, scope_value: &str, rule_name: &str) -> Result<Self> {
        let scope_type: ScopeType = scope_type.parse()?;

        if scope_value.is_empty() {
            return Err(BucketgateError::Validation(format!(
                "scope value for {scope_type} must not be empty"
            )));
        }
        if rule_name.is_empty() {
            return Err(BucketgateError::Validation(
                "rule name must not be empty".to_string(),
            ));
        }

        let encoded = format!(
            "{}:{}|{}:{}|{}:{}",
            scope_type.as_str().len(),
            scope_type,
            scope_value.len(),
            scope_value,
            rule_name.len(),
            rule_name
        );

        Ok(Self {
            scope_type,
            scope_value: scope_value.to_string(),
            rule_name: rule_name.to_string(),
            encoded,
        })
    }

    /// The scope this key was derived from.
    pub fn scope_type(&self) -> &ScopeType {
        &self.scope_type
    }

    /// The raw scope identifier.
    pub fn scope_value(&self) -> &str {
        &self.scope_value
    }

    /// Name of the rule the bucket enforces.
    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    /// The composed string used as the store key.
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}
