//! Token bucket rate limiting logic and state management.

mod backend;
mod bucket;
mod clock;
mod key;
mod limiter;
mod rules;

pub use backend::BucketStore;
pub use bucket::{
    expiry_secs, refill_and_consume, BucketOutcome, BucketState, TokenBucketParams,
    EXPIRY_BUFFER_SECS, MAX_EXPIRY_SECS,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{BucketKey, ScopeType};
pub use limiter::{RateLimitDecision, RateLimiterService, DEFAULT_STORE_TIMEOUT};
pub use rules::{RateLimitRule, RuleSet};
