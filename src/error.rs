//! Error types for the Bucketgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Bucketgate operations.
#[derive(Error, Debug)]
pub enum BucketgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A check referenced a rule that is not in the loaded rule set
    #[error("Unknown rate limit rule: {0}")]
    UnknownRule(String),

    /// Caller supplied malformed input (empty scope value, bad scope type, zero cost)
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested cost can never be satisfied by the rule's bucket
    #[error("Cost {cost} exceeds capacity {max_tokens} of rule {rule}")]
    CostExceedsCapacity {
        /// Rule name
        rule: String,
        /// Requested cost
        cost: u32,
        /// Bucket capacity of the rule
        max_tokens: u32,
    },

    /// Bucket store returned an unusable reply or failed
    #[error("Store error: {0}")]
    Store(String),

    /// Bucket store did not answer within the configured bound
    #[error("Store call timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Violation event could not be handed to its sink
    #[error("Violation reporter error: {0}")]
    Reporter(String),

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BucketgateError {
    /// Whether this error came from the backing store rather than from the caller.
    ///
    /// Only these are absorbed by the fail-open path in `check`; anything else
    /// a store returns is passed to the caller.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            BucketgateError::Store(_) | BucketgateError::StoreTimeout(_) | BucketgateError::Redis(_)
        )
    }
}

/// Result type alias for Bucketgate operations.
pub type Result<T> = std::result::Result<T, BucketgateError>;
