//! Sliding window rate limiting algorithm
//!
//! Tracks every request timestamp for an identity in a sorted set and counts
//! the ones inside the trailing window, so the limit holds over any interval
//! of `window` length rather than per truncated bucket.

use super::{Decision, RateLimiter};
use crate::clock::Clock;
use crate::error::Result;
use crate::keys::{KeyBuilder, LimiterKind};
use crate::rate_limit_config::SlidingWindowConfig;
use crate::store::{Batch, Store};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlidingWindowOutcome {
    pub allowed: bool,
    pub remaining: u64,
    /// Epoch milliseconds at which the oldest counted request leaves the window.
    pub reset_at_ms: i64,
    pub total: u64,
}

/// Sliding window rate limiter implementation
pub struct SlidingWindowLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    keys: KeyBuilder,
    max_requests: u64,
    window_ms: i64,
}

impl SlidingWindowLimiter {
    /// Create a new sliding window rate limiter
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        app_prefix: &str,
        config: SlidingWindowConfig,
    ) -> Self {
        Self {
            store,
            clock,
            keys: KeyBuilder::new(app_prefix, LimiterKind::SlidingWindow),
            max_requests: config.max_requests,
            window_ms: config.window.as_millis() as i64,
        }
    }

    /// Records one request for `user_id` and reports where it stands in the window.
    ///
    /// The request is recorded even when it is denied, so a caller hammering a
    /// closed window keeps it closed.
    pub async fn is_allowed(&self, user_id: &str) -> Result<SlidingWindowOutcome> {
        let key = self.keys.key(user_id);
        let now = self.clock.now_ms();
        let window_start = now - self.window_ms;
        // Members must be unique or same-millisecond requests would collapse into one.
        let member = format!("{}-{}", now, Uuid::new_v4().simple());

        let mut batch = Batch::new();
        batch
            .zrem_range_by_score(key.as_str(), 0.0, window_start as f64)
            .zadd(key.as_str(), now as f64, member)
            .zrange(key.as_str())
            .pexpire(key.as_str(), self.window_ms as u64);
        let mut replies = self.store.exec(&batch).await?;
        let timestamps = replies.take(2)?.into_list();
        replies.check()?;

        let count = timestamps.len() as u64;
        let earliest = timestamps
            .first()
            .and_then(|member| member_timestamp(member))
            .unwrap_or(now);

        let outcome = SlidingWindowOutcome {
            allowed: count <= self.max_requests,
            remaining: self.max_requests.saturating_sub(count),
            reset_at_ms: earliest + self.window_ms,
            total: self.max_requests,
        };

        debug!(key = %key, count, allowed = outcome.allowed, "Sliding window check");
        if !outcome.allowed {
            info!(user_id = %user_id, max_requests = self.max_requests, "Sliding window limit exceeded");
        }
        Ok(outcome)
    }

    pub async fn reset(&self, user_id: &str) -> Result<()> {
        self.store.del(&[self.keys.key(user_id)]).await
    }
}

/// Members are `{timestamp_ms}-{uuid}`.
fn member_timestamp(member: &str) -> Option<i64> {
    member.split('-').next()?.parse().ok()
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn kind(&self) -> LimiterKind {
        LimiterKind::SlidingWindow
    }

    async fn check(&self, identity: &str) -> Result<Decision> {
        let now = self.clock.now_ms();
        let outcome = self.is_allowed(identity).await?;
        Ok(Decision {
            allowed: outcome.allowed,
            limit: outcome.total,
            remaining: outcome.remaining,
            reset_at_ms: Some(outcome.reset_at_ms),
            retry_after_ms: (!outcome.allowed)
                .then(|| (outcome.reset_at_ms - now).max(0) as u64),
        })
    }

    async fn reset(&self, identity: &str) -> Result<()> {
        SlidingWindowLimiter::reset(self, identity).await
    }
}
