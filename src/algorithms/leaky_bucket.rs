//! Leaky bucket rate limiting algorithm
//!
//! The dual of the token bucket: admitted requests raise the level and the
//! bucket drains at `leak_rate` per second. State is a single hash
//! (`level`, `lastUpdate`) whose TTL is refreshed on every call so abandoned
//! buckets are reclaimed by the store. Drain, admission and write-back run as
//! one store-side script.

use super::{millis_for, Decision, RateLimiter};
use crate::clock::Clock;
use crate::error::Result;
use crate::keys::{KeyBuilder, LimiterKind};
use crate::rate_limit_config::LeakyBucketConfig;
use crate::store::{Batch, Script, ScriptOutcome, Store};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INACTIVITY_TTL_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakyBucketOutcome {
    pub allowed: bool,
    /// Level after this request was accounted for.
    pub current_level: u64,
    pub capacity: u64,
    /// Zero when admitted, otherwise the time for one request to leak out.
    pub estimated_wait_ms: u64,
}

pub struct LeakyBucketLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    keys: KeyBuilder,
    capacity: u64,
    leak_rate: f64,
}

impl LeakyBucketLimiter {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        app_prefix: &str,
        config: LeakyBucketConfig,
    ) -> Self {
        Self {
            store,
            clock,
            keys: KeyBuilder::new(app_prefix, LimiterKind::LeakyBucket),
            capacity: config.capacity,
            leak_rate: config.leak_rate,
        }
    }

    /// A full bucket must be able to drain completely before the record expires.
    fn idle_ttl_ms(&self) -> u64 {
        millis_for(self.capacity as f64, self.leak_rate)
            .map_or(INACTIVITY_TTL_MS, |ms| ms.max(INACTIVITY_TTL_MS))
    }

    pub async fn is_allowed(&self, identity: &str) -> Result<LeakyBucketOutcome> {
        Ok(self.pour(identity).await?.0)
    }

    pub async fn reset(&self, identity: &str) -> Result<()> {
        self.store.del(&[self.keys.key(identity)]).await
    }

    async fn pour(&self, identity: &str) -> Result<(LeakyBucketOutcome, i64)> {
        let key = self.keys.key(identity);
        let now = self.clock.now_ms();

        let mut batch = Batch::new();
        batch.eval(
            Script::LeakyBucket {
                now_ms: now,
                capacity: self.capacity,
                leak_rate: self.leak_rate,
                ttl_ms: self.idle_ttl_ms(),
            },
            vec![key.clone()],
        );
        let reply = self.store.exec(&batch).await?.take(0)?;
        let outcome = ScriptOutcome::from_reply(&key, reply)?;
        if outcome.malformed {
            warn!(key = %key, "Replaced malformed leaky bucket state with an empty bucket");
        }
        let (allowed, level) = (outcome.allowed, outcome.value.max(0) as u64);

        let estimated_wait_ms = if allowed {
            0
        } else {
            millis_for(1.0, self.leak_rate).unwrap_or(0)
        };

        debug!(key = %key, level, allowed, "Leaky bucket check");
        if !allowed {
            info!(identity = %identity, capacity = self.capacity, "Leaky bucket overflow");
        }

        Ok((
            LeakyBucketOutcome {
                allowed,
                current_level: level,
                capacity: self.capacity,
                estimated_wait_ms,
            },
            now,
        ))
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::LeakyBucket
    }

    async fn check(&self, identity: &str) -> Result<Decision> {
        let (outcome, now) = self.pour(identity).await?;
        let drained_at = millis_for(outcome.current_level as f64, self.leak_rate)
            .map(|ms| now + ms as i64);
        Ok(Decision {
            allowed: outcome.allowed,
            limit: outcome.capacity,
            remaining: outcome.capacity.saturating_sub(outcome.current_level),
            reset_at_ms: drained_at,
            retry_after_ms: (!outcome.allowed).then_some(outcome.estimated_wait_ms),
        })
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        LeakyBucketLimiter::reset(self, identity).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn limiter(capacity: u64, leak_rate: f64) -> (LeakyBucketLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let limiter = LeakyBucketLimiter::new(
            store.clone(),
            Arc::new(clock.clone()),
            "app",
            LeakyBucketConfig {
                capacity,
                leak_rate,
            },
        );
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_fills_to_capacity_then_overflows() {
        let (limiter, _, _) = limiter(4, 1.0);
        for expected_level in 1..=4 {
            let outcome = limiter.is_allowed("k").await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.current_level, expected_level);
        }

        let denied = limiter.is_allowed("k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current_level, 4);
        assert_eq!(denied.capacity, 4);
        assert_eq!(denied.estimated_wait_ms, 1_000);
    }

    #[tokio::test]
    async fn test_drains_over_time() {
        let (limiter, _, clock) = limiter(4, 2.0);
        for _ in 0..4 {
            limiter.is_allowed("k").await.unwrap();
        }
        assert!(!limiter.is_allowed("k").await.unwrap().allowed);

        clock.advance(Duration::from_millis(500));
        let outcome = limiter.is_allowed("k").await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.current_level, 4);

        clock.advance(Duration::from_secs(10));
        for _ in 0..4 {
            assert!(limiter.is_allowed("k").await.unwrap().allowed);
        }
    }

    #[tokio::test]
    async fn test_inactivity_ttl_refreshed() {
        let (limiter, store, clock) = limiter(10, 1.0);
        limiter.is_allowed("k").await.unwrap();
        assert_eq!(store.ttl_ms("app:leaky-bucket:k"), Some(60_000));

        clock.advance(Duration::from_secs(30));
        limiter.is_allowed("k").await.unwrap();
        assert_eq!(store.ttl_ms("app:leaky-bucket:k"), Some(60_000));

        clock.advance(Duration::from_secs(60));
        assert!(!store.contains_key("app:leaky-bucket:k"));
    }

    #[tokio::test]
    async fn test_slow_leak_extends_ttl() {
        let (limiter, store, _) = limiter(1000, 10.0);
        limiter.is_allowed("k").await.unwrap();
        assert_eq!(store.ttl_ms("app:leaky-bucket:k"), Some(100_000));
    }

    #[tokio::test]
    async fn test_reset_behaves_as_unseen() {
        let (limiter, store, _) = limiter(1, 0.5);
        assert!(limiter.is_allowed("k").await.unwrap().allowed);
        assert!(!limiter.is_allowed("k").await.unwrap().allowed);

        limiter.reset("k").await.unwrap();
        assert!(store.is_empty());
        let outcome = limiter.is_allowed("k").await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.current_level, 1);
    }

    #[tokio::test]
    async fn test_malformed_record_treated_as_empty() {
        let (limiter, store, _) = limiter(2, 1.0);
        let mut batch = Batch::new();
        batch
            .hset("app:leaky-bucket:k", "level", "full")
            .hset("app:leaky-bucket:k", "lastUpdate", "never");
        store.exec(&batch).await.unwrap().check().unwrap();

        let outcome = limiter.is_allowed("k").await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.current_level, 1);
    }

    #[tokio::test]
    async fn test_decision_through_trait() {
        let (limiter, _, _) = limiter(2, 1.0);
        let limiter: &dyn RateLimiter = &limiter;
        let first = limiter.check("k").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        limiter.check("k").await.unwrap();
        let denied = limiter.check("k").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, Some(1_000));

        limiter.reset("k").await.unwrap();
        assert!(limiter.check("k").await.unwrap().allowed);
    }
}
