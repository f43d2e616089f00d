//! Token bucket rate limiting algorithm
//!
//! State is two string keys per identity, `:count` and `:lastRefill`. Refill is
//! computed from elapsed time in whole tokens and both keys are rewritten on
//! every call, admitted or not, inside the same store-side script that reads them.

use super::{millis_for, Decision, RateLimiter};
use crate::clock::Clock;
use crate::error::Result;
use crate::keys::{KeyBuilder, LimiterKind};
use crate::rate_limit_config::TokenBucketConfig;
use crate::store::{Batch, Script, ScriptOutcome, Store};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MIN_IDLE_TTL_MS: u64 = 60_000;

pub struct TokenBucketLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    keys: KeyBuilder,
    capacity: u64,
    refill_rate: f64,
    allow_debt: bool,
}

/// Bucket contents after one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Refilled {
    allowed: bool,
    tokens: i64,
}

impl TokenBucketLimiter {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        app_prefix: &str,
        config: TokenBucketConfig,
    ) -> Self {
        Self {
            store,
            clock,
            keys: KeyBuilder::new(app_prefix, LimiterKind::TokenBucket),
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            allow_debt: config.allow_debt,
        }
    }

    fn count_key(&self, identity: &str) -> String {
        self.keys.key_with_suffix(identity, "count")
    }

    fn last_refill_key(&self, identity: &str) -> String {
        self.keys.key_with_suffix(identity, "lastRefill")
    }

    /// Lowest balance that still admits a request.
    fn admission_floor(&self) -> i64 {
        if self.allow_debt {
            0
        } else {
            1
        }
    }

    /// Long enough that expiry can only ever hand back a bucket refill would
    /// already have filled: from one token of debt up to capacity.
    fn idle_ttl_ms(&self) -> Option<u64> {
        millis_for(self.capacity as f64 + 1.0, self.refill_rate).map(|ms| ms.max(MIN_IDLE_TTL_MS))
    }

    async fn take(&self, identity: &str) -> Result<(Refilled, i64)> {
        let count_key = self.count_key(identity);
        let last_key = self.last_refill_key(identity);
        let now = self.clock.now_ms();

        let mut batch = Batch::new();
        batch.eval(
            Script::TokenBucket {
                now_ms: now,
                capacity: self.capacity,
                refill_rate: self.refill_rate,
                floor: self.admission_floor(),
                ttl_ms: self.idle_ttl_ms(),
            },
            vec![last_key, count_key.clone()],
        );
        let reply = self.store.exec(&batch).await?.take(0)?;
        let outcome = ScriptOutcome::from_reply(&count_key, reply)?;
        if outcome.malformed {
            warn!(key = %count_key, "Replaced malformed token bucket state with a full bucket");
        }
        let refilled = Refilled {
            allowed: outcome.allowed,
            tokens: outcome.value,
        };

        debug!(
            key = %count_key,
            tokens = refilled.tokens,
            allowed = refilled.allowed,
            "Token bucket check"
        );
        if !refilled.allowed {
            info!(identity = %identity, capacity = self.capacity, "Token bucket empty");
        }
        Ok((refilled, now))
    }

    pub async fn is_allowed(&self, identity: &str) -> Result<bool> {
        let (refilled, _) = self.take(identity).await?;
        Ok(refilled.allowed)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::TokenBucket
    }

    async fn check(&self, identity: &str) -> Result<Decision> {
        let (refilled, now) = self.take(identity).await?;
        let tokens = refilled.tokens as f64;

        let retry_after_ms = if refilled.allowed {
            None
        } else {
            millis_for(self.admission_floor() as f64 - tokens, self.refill_rate)
        };
        let reset_at_ms = millis_for(self.capacity as f64 - tokens, self.refill_rate)
            .map(|ms| now + ms as i64);

        Ok(Decision {
            allowed: refilled.allowed,
            limit: self.capacity,
            remaining: refilled.tokens.max(0) as u64,
            reset_at_ms,
            retry_after_ms,
        })
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.store
            .del(&[self.count_key(identity), self.last_refill_key(identity)])
            .await
    }
}
