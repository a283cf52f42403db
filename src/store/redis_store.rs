//! Redis-backed bucket store.
//!
//! The refill-and-consume step runs server-side as a Lua script, so every
//! instance sharing the Redis server sees one total order of updates per key.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use crate::error::{BucketgateError, Result};
use crate::ratelimit::{BucketKey, BucketOutcome, BucketState, BucketStore, TokenBucketParams};

/// Lua port of `ratelimit::bucket::refill_and_consume`.
///
/// KEYS[1] bucket hash; ARGV: max_tokens, refill_rate (per minute), cost,
/// now (epoch seconds), ttl (seconds). Floats are returned as strings since
/// Redis truncates Lua numbers to integers in replies.
const TAKE_TOKENS_SCRIPT: &str = r#"
local key = KEYS[1]
local max_tokens = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local rate = refill_rate / 60.0
local stored = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(stored[1])
local last_refill = tonumber(stored[2])

if tokens == nil or last_refill == nil then
  tokens = max_tokens
  last_refill = now
end

local elapsed = math.max(0, now - last_refill)
local candidate = math.min(max_tokens, tokens + elapsed * rate)

local allowed = 0
local retry_after = 0
if candidate >= cost then
  candidate = candidate - cost
  allowed = 1
else
  retry_after = (cost - candidate) / rate
end

local function exact(n)
  return string.format('%.17g', n)
end

redis.call('HSET', key, 'tokens', exact(candidate), 'last_refill', exact(now))
redis.call('EXPIRE', key, ttl)

return {allowed, exact(candidate), exact(retry_after)}
"#;

/// Redis implementation of the bucket store.
#[derive(Clone)]
pub struct RedisBucketStore {
    connection: ConnectionManager,
    key_prefix: String,
    script: Script,
}

impl RedisBucketStore {
    /// Connect to Redis at `url`. Bucket keys are namespaced under `key_prefix`.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        let key_prefix = key_prefix.into();

        info!(key_prefix = %key_prefix, "Connected to Redis bucket store");

        Ok(Self {
            connection,
            key_prefix,
            script: Script::new(TAKE_TOKENS_SCRIPT),
        })
    }

    fn key_for(&self, key: &BucketKey) -> String {
        redis_key(&self.key_prefix, key)
    }
}

fn redis_key(prefix: &str, key: &BucketKey) -> String {
    format!("{prefix}:{key}")
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn take(
        &self,
        key: &BucketKey,
        params: &TokenBucketParams,
        now: f64,
    ) -> Result<BucketOutcome> {
        let redis_key = self.key_for(key);
        let mut connection = self.connection.clone();

        let (allowed, tokens, retry_after_secs): (i64, f64, f64) = self
            .script
            .key(&redis_key)
            .arg(params.max_tokens)
            .arg(params.refill_rate)
            .arg(params.cost)
            .arg(now)
            .arg(params.expiry_secs())
            .invoke_async(&mut connection)
            .await?;

        if !tokens.is_finite() || !retry_after_secs.is_finite() {
            return Err(BucketgateError::Store(format!(
                "invalid token bucket reply for {redis_key}: tokens={tokens} retry_after={retry_after_secs}"
            )));
        }

        debug!(key = %redis_key, allowed = allowed, tokens = tokens, "Token bucket script executed");

        Ok(BucketOutcome {
            allowed: allowed == 1,
            tokens,
            retry_after_secs,
        })
    }

    // Redis expires keys on its own clock; `now` is not needed to filter.
    async fn get(&self, key: &BucketKey, _now: f64) -> Result<Option<BucketState>> {
        let redis_key = self.key_for(key);
        let mut connection = self.connection.clone();

        let (tokens, last_refill): (Option<f64>, Option<f64>) = redis::cmd("HMGET")
            .arg(&redis_key)
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut connection)
            .await?;

        Ok(match (tokens, last_refill) {
            (Some(tokens), Some(last_refill)) => Some(BucketState {
                tokens,
                last_refill,
            }),
            _ => None,
        })
    }

    async fn set(
        &self,
        key: &BucketKey,
        state: BucketState,
        ttl_secs: u64,
        _now: f64,
    ) -> Result<()> {
        let redis_key = self.key_for(key);
        let mut connection = self.connection.clone();

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(&redis_key)
            .arg("tokens")
            .arg(state.tokens)
            .arg("last_refill")
            .arg(state.last_refill)
            .ignore()
            .cmd("EXPIRE")
            .arg(&redis_key)
            .arg(ttl_secs)
            .ignore()
            .query_async(&mut connection)
            .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let reply: String = redis::cmd("PING").query_async(&mut connection).await?;

        if reply == "PONG" {
            Ok(())
        } else {
            Err(BucketgateError::Store(format!("unexpected PING reply: {reply}")))
        }
    }
}
