//! Check-and-update scripts.
//!
//! A limiter whose decision depends on stored state cannot read in one batch
//! and write in the next: concurrent callers would interleave between the two
//! and lose updates. Instead the whole read-modify-write travels as a single
//! [`Script`] command. Redis evaluates the Lua source server-side, and
//! [`MemoryStore`](super::MemoryStore) runs the same arithmetic under its batch
//! lock through [`refill`] and [`leak`].
//!
//! Every script replies with three integers: `[allowed, value, malformed]`.

use super::Reply;
use crate::error::{LimiterError, Result};

/// Fixed window. `KEYS[1]` is the counter. Replies with the count seen before this request.
pub const FIXED_WINDOW_LUA: &str = r#"
local function stored_int(raw)
  if not raw then return nil, 0 end
  if string.match(raw, '^%s*%-?%d+%s*$') then return tonumber(raw), 0 end
  return nil, 1
end

local limit = tonumber(ARGV[1])
local count, malformed = stored_int(redis.call('GET', KEYS[1]))
count = math.max(count or 0, 0)

if count < limit then
  if malformed == 1 then
    redis.call('SET', KEYS[1], 0)
  end
  redis.call('INCR', KEYS[1])
  redis.call('EXPIRE', KEYS[1], ARGV[2], 'NX')
  return {1, count, malformed}
end
return {0, count, malformed}
"#;

/// Token bucket. `KEYS[1]` is the last refill time, `KEYS[2]` the token count.
/// Replies with the balance after this request.
pub const TOKEN_BUCKET_LUA: &str = r#"
local function stored_int(raw)
  if not raw then return nil, 0 end
  if string.match(raw, '^%s*%-?%d+%s*$') then return tonumber(raw), 0 end
  return nil, 1
end

local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local floor = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local last, bad_last = stored_int(redis.call('GET', KEYS[1]))
local tokens, bad_tokens = stored_int(redis.call('GET', KEYS[2]))
last = last or now
tokens = tokens or capacity

local elapsed = math.max(now - last, 0) / 1000
tokens = math.min(tokens + math.floor(elapsed * rate), capacity)

local allowed = 0
if tokens >= floor then
  allowed = 1
  tokens = tokens - 1
end

redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], string.format('%d', tokens))
if ttl > 0 then
  redis.call('PEXPIRE', KEYS[1], ttl)
  redis.call('PEXPIRE', KEYS[2], ttl)
end
return {allowed, tokens, math.max(bad_last, bad_tokens)}
"#;

/// Leaky bucket. `KEYS[1]` is a hash of `level` and `lastUpdate`.
/// Replies with the level after this request.
pub const LEAKY_BUCKET_LUA: &str = r#"
local function stored_int(raw)
  if not raw then return nil, 0 end
  if string.match(raw, '^%s*%-?%d+%s*$') then return tonumber(raw), 0 end
  return nil, 1
end

local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', KEYS[1], 'level', 'lastUpdate')
local level, bad_level = stored_int(state[1])
local last, bad_last = stored_int(state[2])
level = math.max(level or 0, 0)
last = last or now

local elapsed = math.max(now - last, 0) / 1000
level = math.max(level - math.floor(elapsed * rate), 0)

local allowed = 0
if level < capacity then
  allowed = 1
  level = level + 1
end

redis.call('HSET', KEYS[1], 'lastUpdate', ARGV[1], 'level', string.format('%d', level))
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, level, math.max(bad_level, bad_last)}
"#;

pub const FIELD_LEVEL: &str = "level";
pub const FIELD_LAST_UPDATE: &str = "lastUpdate";

/// An atomic check-and-update with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    FixedWindow {
        limit: u64,
        window_secs: u64,
    },
    TokenBucket {
        now_ms: i64,
        capacity: u64,
        refill_rate: f64,
        /// Lowest balance that still admits a request.
        floor: i64,
        /// Idle expiry for both keys; `None` keeps them forever.
        ttl_ms: Option<u64>,
    },
    LeakyBucket {
        now_ms: i64,
        capacity: u64,
        leak_rate: f64,
        ttl_ms: u64,
    },
}

impl Script {
    pub fn source(&self) -> &'static str {
        match self {
            Script::FixedWindow { .. } => FIXED_WINDOW_LUA,
            Script::TokenBucket { .. } => TOKEN_BUCKET_LUA,
            Script::LeakyBucket { .. } => LEAKY_BUCKET_LUA,
        }
    }

    /// Number of keys the script expects.
    pub fn key_count(&self) -> usize {
        match self {
            Script::TokenBucket { .. } => 2,
            Script::FixedWindow { .. } | Script::LeakyBucket { .. } => 1,
        }
    }

    /// `ARGV`, in the order the Lua source reads it.
    pub fn args(&self) -> Vec<String> {
        match self {
            Script::FixedWindow { limit, window_secs } => {
                vec![limit.to_string(), window_secs.to_string()]
            }
            Script::TokenBucket {
                now_ms,
                capacity,
                refill_rate,
                floor,
                ttl_ms,
            } => vec![
                now_ms.to_string(),
                capacity.to_string(),
                refill_rate.to_string(),
                floor.to_string(),
                ttl_ms.unwrap_or(0).to_string(),
            ],
            Script::LeakyBucket {
                now_ms,
                capacity,
                leak_rate,
                ttl_ms,
            } => vec![
                now_ms.to_string(),
                capacity.to_string(),
                leak_rate.to_string(),
                ttl_ms.to_string(),
            ],
        }
    }
}

/// Decoded `[allowed, value, malformed]` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub allowed: bool,
    pub value: i64,
    /// Some stored state could not be parsed and was replaced by its default.
    pub malformed: bool,
}

impl ScriptOutcome {
    pub fn from_reply(key: &str, reply: Reply) -> Result<Self> {
        match reply {
            Reply::Ints(values) => match values.as_slice() {
                &[allowed, value, malformed] => Ok(Self {
                    allowed: allowed == 1,
                    value,
                    malformed: malformed == 1,
                }),
                _ => Err(mismatch(key)),
            },
            _ => Err(mismatch(key)),
        }
    }

    pub fn into_reply(self) -> Reply {
        Reply::Ints(vec![
            self.allowed as i64,
            self.value,
            self.malformed as i64,
        ])
    }
}

fn mismatch(key: &str) -> LimiterError {
    LimiterError::SchemaMismatch {
        key: key.to_string(),
        expected: "script reply [allowed, value, malformed]",
    }
}

/// Whole units produced by `rate_per_sec` over the span from `since_ms` to `now_ms`.
pub fn units_elapsed(since_ms: i64, now_ms: i64, rate_per_sec: f64) -> i64 {
    let elapsed_secs = (now_ms - since_ms).max(0) as f64 / 1000.0;
    (elapsed_secs * rate_per_sec).floor() as i64
}

/// Refills `tokens` for the time since `last_refill_ms`, capped at `capacity`,
/// then takes one token if the balance is at least `floor`.
pub fn refill(
    tokens: i64,
    last_refill_ms: i64,
    now_ms: i64,
    capacity: u64,
    refill_rate: f64,
    floor: i64,
) -> (bool, i64) {
    let added = units_elapsed(last_refill_ms, now_ms, refill_rate);
    let tokens = tokens.saturating_add(added).min(capacity as i64);
    if tokens >= floor {
        (true, tokens - 1)
    } else {
        (false, tokens)
    }
}

/// Drains `level` for the time since `last_update_ms`, then adds one request
/// if there is room below `capacity`.
pub fn leak(level: i64, last_update_ms: i64, now_ms: i64, capacity: u64, leak_rate: f64) -> (bool, i64) {
    let leaked = units_elapsed(last_update_ms, now_ms, leak_rate);
    let level = level.max(0).saturating_sub(leaked).max(0);
    if level < capacity as i64 {
        (true, level + 1)
    } else {
        (false, level)
    }
}
