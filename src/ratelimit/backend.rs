//! Bucket store trait for abstracting in-process and shared backends.

use async_trait::async_trait;

use super::bucket::{BucketOutcome, BucketState, TokenBucketParams};
use super::key::BucketKey;
use crate::error::Result;

/// Trait for bucket store implementations.
///
/// `take` must run the whole refill-and-consume step for one key as a single
/// atomic unit and refresh the key's expiry in the same unit. Distinct keys
/// carry no ordering requirement.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Refill the bucket at `key` to `now` and try to take `params.cost` tokens.
    async fn take(
        &self,
        key: &BucketKey,
        params: &TokenBucketParams,
        now: f64,
    ) -> Result<BucketOutcome>;

    /// Read the stored state as of `now` without modifying it. Diagnostics only.
    async fn get(&self, key: &BucketKey, now: f64) -> Result<Option<BucketState>>;

    /// Overwrite the stored state, expiring `ttl_secs` after `now`. Diagnostics only.
    ///
    /// `now` is the same clock reading the caller used for `state.last_refill`.
    async fn set(&self, key: &BucketKey, state: BucketState, ttl_secs: u64, now: f64)
        -> Result<()>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;
}
