//! Rate limiting algorithms module
//!
//! Every algorithm keeps its authoritative state in the shared [`Store`] and
//! holds no in-process counters, so any number of service instances can gate
//! the same identities. Each one exposes its own result type through an
//! inherent `is_allowed`, and a uniform [`Decision`] through [`RateLimiter`].
//!
//! [`Store`]: crate::store::Store

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

use crate::error::Result;
use crate::keys::LimiterKind;
use async_trait::async_trait;
use serde::Serialize;

pub use fixed_window::FixedWindowLimiter;
pub use leaky_bucket::{LeakyBucketLimiter, LeakyBucketOutcome};
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowOutcome};
pub use token_bucket::TokenBucketLimiter;

/// Outcome of a single admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    /// Requests the limiter admits per window or bucket.
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the caller's budget is fully restored, when known.
    pub reset_at_ms: Option<i64>,
    /// How long a denied caller should wait before retrying, when known.
    pub retry_after_ms: Option<u64>,
}

/// Capability shared by every limiter kind.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn kind(&self) -> LimiterKind;

    /// Checks, and records, one request for `identity`.
    async fn check(&self, identity: &str) -> Result<Decision>;

    /// Forgets all state for `identity`.
    async fn reset(&self, identity: &str) -> Result<()>;
}

/// Milliseconds needed to accumulate `units` at `rate_per_sec`, rounded up.
pub(crate) fn millis_for(units: f64, rate_per_sec: f64) -> Option<u64> {
    if rate_per_sec <= 0.0 || !rate_per_sec.is_finite() {
        return None;
    }
    Some((units.max(0.0) * 1000.0 / rate_per_sec).ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_for() {
        assert_eq!(millis_for(1.0, 1.0), Some(1_000));
        assert_eq!(millis_for(1.0, 3.0), Some(334));
        assert_eq!(millis_for(1.0, 0.0), None);
    }
}
