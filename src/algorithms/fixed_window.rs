//! Fixed window rate limiting algorithm
//!
//! One integer counter per identity. The first admitted request of a window
//! starts the key's TTL (`EXPIRE ... NX`), later increments leave it alone, and
//! the store drops the counter when the window elapses. The read, the
//! comparison and the increment run as one store-side script.

use super::{Decision, RateLimiter};
use crate::error::Result;
use crate::keys::{KeyBuilder, LimiterKind};
use crate::rate_limit_config::FixedWindowConfig;
use crate::store::{Batch, Script, ScriptOutcome, Store};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FixedWindowLimiter {
    store: Arc<dyn Store>,
    keys: KeyBuilder,
    limit: u64,
    window_secs: u64,
}

impl FixedWindowLimiter {
    pub fn new(store: Arc<dyn Store>, app_prefix: &str, config: FixedWindowConfig) -> Self {
        Self {
            store,
            keys: KeyBuilder::new(app_prefix, LimiterKind::FixedWindow),
            limit: config.limit,
            window_secs: config.window.as_secs(),
        }
    }

    /// Returns whether the request is admitted, together with the count before it.
    async fn admit(&self, identity: &str) -> Result<(bool, u64)> {
        let key = self.keys.key(identity);

        let mut batch = Batch::new();
        batch.eval(
            Script::FixedWindow {
                limit: self.limit,
                window_secs: self.window_secs,
            },
            vec![key.clone()],
        );
        let reply = self.store.exec(&batch).await?.take(0)?;
        let outcome = ScriptOutcome::from_reply(&key, reply)?;
        if outcome.malformed {
            // The script replaced it with 0, clearing the old TTL with it.
            warn!(key = %key, "Reset malformed window counter");
        }
        let (allowed, count) = (outcome.allowed, outcome.value.max(0) as u64);

        debug!(key = %key, count, limit = self.limit, allowed, "Fixed window check");
        Ok((allowed, count))
    }

    pub async fn is_allowed(&self, identity: &str) -> Result<bool> {
        let (allowed, _) = self.admit(identity).await?;
        if !allowed {
            info!(identity = %identity, limit = self.limit, "Fixed window limit exceeded");
        }
        Ok(allowed)
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::FixedWindow
    }

    async fn check(&self, identity: &str) -> Result<Decision> {
        let (allowed, count) = self.admit(identity).await?;
        if !allowed {
            info!(identity = %identity, limit = self.limit, "Fixed window limit exceeded");
        }
        let remaining = if allowed {
            self.limit - count - 1
        } else {
            0
        };
        Ok(Decision {
            allowed,
            limit: self.limit,
            remaining,
            reset_at_ms: None,
            retry_after_ms: None,
        })
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        self.store.del(&[self.keys.key(identity)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn limiter(limit: u64, window_secs: u64) -> (FixedWindowLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let limiter = FixedWindowLimiter::new(
            store.clone(),
            "app",
            FixedWindowConfig {
                limit,
                window: Duration::from_secs(window_secs),
            },
        );
        (limiter, store, clock)
    }

    #[tokio::test]
    async fn test_admits_limit_then_denies() {
        let (limiter, _, _) = limiter(10, 10);
        for _ in 0..10 {
            assert!(limiter.is_allowed("test").await.unwrap());
        }
        assert!(!limiter.is_allowed("test").await.unwrap());
    }

    #[tokio::test]
    async fn test_window_expiry_reopens() {
        let (limiter, _, clock) = limiter(10, 10);
        for _ in 0..10 {
            assert!(limiter.is_allowed("test").await.unwrap());
        }
        clock.advance(Duration::from_secs(5));
        assert!(!limiter.is_allowed("test").await.unwrap());

        clock.advance(Duration::from_secs(5));
        assert!(limiter.is_allowed("test").await.unwrap());
    }

    #[tokio::test]
    async fn test_later_increments_do_not_extend_window() {
        let (limiter, store, clock) = limiter(5, 10);
        assert!(limiter.is_allowed("k").await.unwrap());
        clock.advance(Duration::from_secs(7));
        assert!(limiter.is_allowed("k").await.unwrap());
        assert_eq!(store.ttl_ms("app:fixed-window:k"), Some(3_000));
    }

    #[tokio::test]
    async fn test_zero_limit_always_denies() {
        let (limiter, store, _) = limiter(0, 10);
        assert!(!limiter.is_allowed("k").await.unwrap());
        assert!(!limiter.is_allowed("k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _, _) = limiter(1, 10);
        assert!(limiter.is_allowed("a").await.unwrap());
        assert!(!limiter.is_allowed("a").await.unwrap());
        assert!(limiter.is_allowed("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_counter_starts_fresh_window() {
        let (limiter, store, clock) = limiter(2, 10);
        let mut batch = Batch::new();
        batch.set("app:fixed-window:k", "not-a-number").expire("app:fixed-window:k", 3, false);
        assert_ok!(store.exec(&batch).await);

        clock.advance(Duration::from_secs(1));
        assert!(limiter.is_allowed("k").await.unwrap());
        assert_eq!(store.ttl_ms("app:fixed-window:k"), Some(10_000));
        assert_eq!(
            store.get("app:fixed-window:k").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_decision_and_reset() {
        let (limiter, _, _) = limiter(3, 10);
        let first = limiter.check("k").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 2);

        limiter.check("k").await.unwrap();
        let third = limiter.check("k").await.unwrap();
        assert_eq!(third.remaining, 0);
        assert!(!limiter.check("k").await.unwrap().allowed);

        limiter.reset("k").await.unwrap();
        assert!(limiter.check("k").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        struct DownStore;

        #[async_trait]
        impl Store for DownStore {
            async fn exec(&self, _batch: &Batch) -> Result<crate::store::BatchReplies> {
                Err(crate::error::LimiterError::StoreUnavailable("connection refused".into()))
            }
            async fn ping(&self) -> Result<()> {
                Err(crate::error::LimiterError::StoreUnavailable("connection refused".into()))
            }
        }

        let limiter = FixedWindowLimiter::new(
            Arc::new(DownStore),
            "app",
            FixedWindowConfig {
                limit: 1,
                window: Duration::from_secs(1),
            },
        );
        assert_err!(limiter.is_allowed("k").await);
    }
}
