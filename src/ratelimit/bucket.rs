//! Token bucket state and the refill-and-consume step.
//!
//! [`refill_and_consume`] is the whole admission algorithm. Stores run it as
//! one indivisible unit per key: the in-process store calls it under the
//! key's shard lock and the Redis store executes a Lua port of it.

use serde::{Deserialize, Serialize};

/// Extra time an idle bucket lives past the point it would be full again.
pub const EXPIRY_BUFFER_SECS: u64 = 60;

/// Upper bound on a bucket's time-to-live (one year). Rules whose refill
/// time exceeds it are rejected at load time.
pub const MAX_EXPIRY_SECS: u64 = 365 * 24 * 60 * 60;

/// Store-resident state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Current token count, `0 <= tokens <= max_tokens`
    pub tokens: f64,
    /// Epoch seconds of the last update
    pub last_refill: f64,
}

impl BucketState {
    /// A bucket at capacity, as created on first access.
    pub fn full(max_tokens: u32, now: f64) -> Self {
        Self {
            tokens: f64::from(max_tokens),
            last_refill: now,
        }
    }
}

/// Parameters for one refill-and-consume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketParams {
    /// Bucket capacity
    pub max_tokens: u32,
    /// Tokens added per minute
    pub refill_rate: f64,
    /// Tokens this request wants to take
    pub cost: u32,
}

impl TokenBucketParams {
    /// Refill rate converted to tokens per second.
    pub fn tokens_per_second(&self) -> f64 {
        self.refill_rate / 60.0
    }

    /// Seconds an idle bucket is kept before the store reclaims it.
    pub fn expiry_secs(&self) -> u64 {
        expiry_secs(self.max_tokens, self.refill_rate)
    }
}

/// Result of one refill-and-consume step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether `cost` tokens were taken
    pub allowed: bool,
    /// Token count stored after the step
    pub tokens: f64,
    /// Seconds until `cost` tokens are available; zero when allowed
    pub retry_after_secs: f64,
}

impl BucketOutcome {
    /// Whole tokens left in the bucket.
    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }
}

/// Refill `stored` up to `now`, then try to take `params.cost` tokens.
///
/// A missing state is treated as a full bucket. The returned state must be
/// written back whether or not the request was allowed, so partial refill
/// is never lost.
pub fn refill_and_consume(
    stored: Option<BucketState>,
    params: &TokenBucketParams,
    now: f64,
) -> (BucketState, BucketOutcome) {
    let max_tokens = f64::from(params.max_tokens);
    let cost = f64::from(params.cost);
    let rate = params.tokens_per_second();

    let state = stored.unwrap_or_else(|| BucketState::full(params.max_tokens, now));

    // Callers on other hosts may be behind this bucket's last writer.
    let elapsed = (now - state.last_refill).max(0.0);
    let candidate = (state.tokens + elapsed * rate).min(max_tokens);

    if candidate >= cost {
        let tokens = candidate - cost;
        (
            BucketState {
                tokens,
                last_refill: now,
            },
            BucketOutcome {
                allowed: true,
                tokens,
                retry_after_secs: 0.0,
            },
        )
    } else {
        (
            BucketState {
                tokens: candidate,
                last_refill: now,
            },
            BucketOutcome {
                allowed: false,
                tokens: candidate,
                retry_after_secs: (cost - candidate) / rate,
            },
        )
    }
}

/// Empty-to-full refill time in seconds.
pub fn refill_secs(max_tokens: u32, refill_rate: f64) -> f64 {
    f64::from(max_tokens) * 60.0 / refill_rate
}

/// Time-to-live for a bucket: empty-to-full refill time plus a fixed buffer,
/// capped at [`MAX_EXPIRY_SECS`].
pub fn expiry_secs(max_tokens: u32, refill_rate: f64) -> u64 {
    // `as` saturates, so an infinite refill time lands on u64::MAX.
    let refill = refill_secs(max_tokens, refill_rate).ceil() as u64;
    refill
        .saturating_add(EXPIRY_BUFFER_SECS)
        .min(MAX_EXPIRY_SECS)
}
