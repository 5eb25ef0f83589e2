//! Redis-backed GCRA rate limiting.
//!
//! One Lua script does the whole check atomically on the server: it reads the
//! theoretical arrival time (TAT) for the key, decides, and stores the new TAT
//! with an expiry. The bucket allows `rps` requests in a burst and refills one
//! slot every `1/rps` seconds.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "rate:";

const GCRA_SCRIPT: &str = r#"
redis.replicate_commands()

local key = KEYS[1]
local burst = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])

local emission_interval = period / rate
local increment = emission_interval * cost
local burst_offset = emission_interval * burst

local epoch = 1483228800
local now = redis.call("TIME")
now = (now[1] - epoch) + (now[2] / 1000000)

local tat = redis.call("GET", key)
if not tat then
  tat = now
else
  tat = tonumber(tat)
end
tat = math.max(tat, now)

local new_tat = tat + increment
local allow_at = new_tat - burst_offset
local diff = now - allow_at
local remaining = diff / emission_interval

if remaining < 0 then
  return {0, 0, tostring(-diff), tostring(tat - now)}
end

local reset_after = new_tat - now
if reset_after > 0 then
  redis.call("SET", key, new_tat, "EX", math.ceil(reset_after))
end
return {cost, remaining, "-1", tostring(reset_after)}
"#;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("unexpected rate limit reply: {0}")]
    Reply(String),
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// How long until a request would be allowed. Zero when allowed.
    pub retry_after: Duration,
    /// How long until the bucket is full again.
    pub reset_after: Duration,
}

impl RateDecision {
    fn from_reply(limit: u32, reply: (i64, i64, String, String)) -> Result<Self, RateLimitError> {
        let (allowed, remaining, retry_after, reset_after) = reply;
        Ok(Self {
            allowed: allowed > 0,
            limit,
            remaining: remaining.clamp(0, i64::from(limit)) as u32,
            retry_after: seconds(&retry_after)?,
            reset_after: seconds(&reset_after)?,
        })
    }
}

fn seconds(raw: &str) -> Result<Duration, RateLimitError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| RateLimitError::Reply(raw.to_string()))?;
    if value.is_finite() && value > 0.0 {
        Ok(Duration::from_secs_f64(value))
    } else {
        Ok(Duration::ZERO)
    }
}

pub struct RedisRateLimiter {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    script: redis::Script,
    rps: u32,
}

impl RedisRateLimiter {
    /// Does not connect; the first check or ping does.
    pub fn new(redis_url: impl AsRef<str>, rps: u32) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RateLimitError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
            script: redis::Script::new(GCRA_SCRIPT),
            rps: rps.max(1),
        })
    }

    /// Spend one request from `key`'s bucket.
    pub async fn check(&self, key: &str) -> Result<RateDecision, RateLimitError> {
        let mut conn = self.connection().await?;
        let reply: (i64, i64, String, String) = self
            .script
            .key(format!("{KEY_PREFIX}{key}"))
            .arg(self.rps)
            .arg(self.rps)
            .arg(1)
            .arg(1)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| self.command_failed(e))?;

        let decision = RateDecision::from_reply(self.rps, reply)?;
        debug!(key, allowed = decision.allowed, remaining = decision.remaining, "rate limit checked");
        Ok(decision)
    }

    pub async fn ping(&self) -> Result<(), RateLimitError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_failed(e))?;
        Ok(())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RateLimitError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RateLimitError::Connection(e.to_string()))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    fn command_failed(&self, err: redis::RedisError) -> RateLimitError {
        if err.is_io_error() || err.is_connection_dropped() {
            // Reconnect on the next call.
            if let Ok(mut slot) = self.connection.try_lock() {
                slot.take();
            }
            warn!(error = %err, "redis connection lost");
        }
        RateLimitError::Command(err.to_string())
    }
}
