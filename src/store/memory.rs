//! In-process bucket store.
//!
//! Buckets live in a [`DashMap`]; the entry API holds the key's shard lock
//! for the whole refill-and-consume step, which gives the same per-key
//! atomicity the shared store gets from server-side scripting. Expiry is
//! measured against the caller's `now`: an expired entry is treated as absent
//! on its next access, and every `sweep_interval` takes the whole map is
//! swept so buckets that are never touched again are freed.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use crate::error::Result;
use crate::ratelimit::{
    refill_and_consume, BucketKey, BucketOutcome, BucketState, BucketStore, TokenBucketParams,
};

/// Takes between two sweeps of expired buckets.
pub const DEFAULT_SWEEP_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: f64,
}

impl StoredBucket {
    fn live(&self, now: f64) -> Option<BucketState> {
        (now < self.expires_at).then_some(self.state)
    }
}

/// A bucket store held in process memory.
///
/// Suitable for single-instance deployments and tests. It does not share
/// state across processes.
pub struct MemoryBucketStore {
    buckets: DashMap<String, StoredBucket>,
    takes: AtomicU64,
    sweep_interval: u64,
}

impl MemoryBucketStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create an empty store that sweeps expired buckets every `interval` takes.
    pub fn with_sweep_interval(interval: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            takes: AtomicU64::new(0),
            sweep_interval: interval.max(1),
        }
    }

    /// Drop every bucket that has expired by `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: f64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| now < bucket.expires_at);
        let removed = before.saturating_sub(self.buckets.len());
        trace!(removed = removed, "Purged expired buckets");
        removed
    }

    /// Number of stored buckets, including any not yet purged.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for MemoryBucketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    async fn take(
        &self,
        key: &BucketKey,
        params: &TokenBucketParams,
        now: f64,
    ) -> Result<BucketOutcome> {
        let ttl = params.expiry_secs() as f64;

        let outcome = match self.buckets.entry(key.as_str().to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get().live(now);
                let (state, outcome) = refill_and_consume(stored, params, now);
                occupied.insert(StoredBucket {
                    state,
                    expires_at: now + ttl,
                });
                outcome
            }
            Entry::Vacant(vacant) => {
                let (state, outcome) = refill_and_consume(None, params, now);
                vacant.insert(StoredBucket {
                    state,
                    expires_at: now + ttl,
                });
                outcome
            }
        };

        // The entry guard is released above; `retain` takes every shard lock.
        let taken = self.takes.fetch_add(1, Ordering::Relaxed) + 1;
        if taken % self.sweep_interval == 0 {
            self.purge_expired(now);
        }

        Ok(outcome)
    }

    async fn get(&self, key: &BucketKey, now: f64) -> Result<Option<BucketState>> {
        Ok(self
            .buckets
            .get(key.as_str())
            .and_then(|bucket| bucket.live(now)))
    }

    async fn set(
        &self,
        key: &BucketKey,
        state: BucketState,
        ttl_secs: u64,
        now: f64,
    ) -> Result<()> {
        let expires_at = now + ttl_secs as f64;
        self.buckets
            .insert(key.as_str().to_string(), StoredBucket { state, expires_at });
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
