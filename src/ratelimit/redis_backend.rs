use async_trait::async_trait;
use redis::{
    Script,
    aio::ConnectionManager,
};

use crate::{
    config::MAX_STATE_TTL,
    error::{LimiterError, LimiterResult},
    ratelimit::{BucketOutcome, BucketRequest, BucketStore, codec},
};

// Same arithmetic as `engine::compute`, executed atomically by Redis. The
// hash layout and number formatting match `codec`.
const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])
local version = ARGV[6]

local state = redis.call('HMGET', key, 'tokens', 'ts', 'v')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
local recovered = 0

if state[1] == false and state[2] == false then
  tokens = capacity
  ts = now_ms
elseif tokens == nil or ts == nil or tokens ~= tokens or tokens < 0
    or tokens == math.huge or (state[3] ~= false and state[3] ~= version) then
  tokens = capacity
  ts = now_ms
  recovered = 1
end

local delta_seconds = math.max(0, now_ms - ts) / 1000.0
local refilled = math.max(0, math.min(capacity, tokens + (delta_seconds * refill)))

local allowed = 0
local remaining = refilled
if capacity > 0 and refilled >= cost then
  allowed = 1
  remaining = refilled - cost
end

local encoded = string.format('%.17g', remaining)
redis.call('HMSET', key, 'tokens', encoded, 'ts', ARGV[3], 'v', version)
redis.call('PEXPIRE', key, ttl_ms)

return {allowed, encoded, recovered}
"#;

pub struct RedisBucketStore {
    manager: ConnectionManager,
    script: Script,
}

impl RedisBucketStore {
    pub async fn new(url: String) -> LimiterResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self::from_manager(manager))
    }

    pub fn from_manager(manager: ConnectionManager) -> Self {
        Self {
            manager,
            script: Script::new(TOKEN_BUCKET_LUA),
        }
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn apply(&self, request: BucketRequest<'_>) -> LimiterResult<BucketOutcome> {
        let mut conn = self.manager.clone();
        let ttl_ms = i64::try_from(request.ttl.min(MAX_STATE_TTL).as_millis())
            .unwrap_or(i64::MAX)
            .max(1);

        let (allowed, tokens, recovered): (i64, String, i64) = self
            .script
            .key(request.key)
            .arg(request.config.capacity)
            .arg(request.config.refill_rate)
            .arg(request.now_ms)
            .arg(request.cost)
            .arg(ttl_ms)
            .arg(codec::CODEC_VERSION)
            .invoke_async(&mut conn)
            .await?;

        let tokens = tokens.parse::<f64>().map_err(|e| {
            LimiterError::StoreUnavailable(format!("unexpected script reply {tokens}: {e}"))
        })?;

        Ok(BucketOutcome {
            allowed: allowed == 1,
            tokens,
            recovered: recovered == 1,
        })
    }
}
