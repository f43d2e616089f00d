use crate::algorithms::{
    FixedWindowLimiter, LeakyBucketLimiter, RateLimiter, SlidingWindowLimiter, TokenBucketLimiter,
};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Which limiter a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    FixedWindow,
    TokenBucket,
    LeakyBucket,
    SlidingWindow,
}

/// Counts requests per key within a truncated window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct FixedWindowConfig {
    /// Requests admitted per window. Zero denies everything.
    pub limit: u64,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_whole_seconds"))]
    pub window: Duration,
}

/// Bucket that refills continuously and is drained by admitted requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TokenBucketConfig {
    #[validate(range(min = 1))]
    pub capacity: u64,
    /// Tokens per second.
    #[validate(range(min = 0.0))]
    pub refill_rate: f64,
    /// Admit while the balance is non-negative, borrowing one token against refill.
    #[serde(default = "default_allow_debt")]
    pub allow_debt: bool,
}

/// Bucket that drains continuously and is filled by admitted requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LeakyBucketConfig {
    #[validate(range(min = 1))]
    pub capacity: u64,
    /// Requests per second.
    #[validate(range(exclusive_min = 0.0))]
    pub leak_rate: f64,
}

/// Exact trailing-window counter over a per-identity timestamp set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SlidingWindowConfig {
    pub max_requests: u64,
    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_at_least_1ms"))]
    pub window: Duration,
}

impl Default for LeakyBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            leak_rate: 10.0,
        }
    }
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(10),
        }
    }
}

fn default_allow_debt() -> bool {
    true
}

/// Windows are stored and pruned in milliseconds, so anything shorter is empty.
fn validate_at_least_1ms(window: &Duration) -> std::result::Result<(), ValidationError> {
    if window.as_millis() < 1 {
        return Err(ValidationError::new("window_must_be_at_least_1ms"));
    }
    Ok(())
}

fn validate_whole_seconds(window: &Duration) -> std::result::Result<(), ValidationError> {
    if window.as_secs() == 0 || window.subsec_nanos() != 0 {
        return Err(ValidationError::new("window_must_be_whole_seconds"));
    }
    Ok(())
}

/// Configuration for any one limiter, tagged by algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum LimiterConfig {
    FixedWindow(FixedWindowConfig),
    TokenBucket(TokenBucketConfig),
    LeakyBucket(LeakyBucketConfig),
    SlidingWindow(SlidingWindowConfig),
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig::SlidingWindow(SlidingWindowConfig::default())
    }
}

impl LimiterConfig {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            LimiterConfig::FixedWindow(_) => Algorithm::FixedWindow,
            LimiterConfig::TokenBucket(_) => Algorithm::TokenBucket,
            LimiterConfig::LeakyBucket(_) => Algorithm::LeakyBucket,
            LimiterConfig::SlidingWindow(_) => Algorithm::SlidingWindow,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            LimiterConfig::FixedWindow(c) => c.validate()?,
            LimiterConfig::TokenBucket(c) => c.validate()?,
            LimiterConfig::LeakyBucket(c) => c.validate()?,
            LimiterConfig::SlidingWindow(c) => c.validate()?,
        }
        Ok(())
    }

    /// Validates the configuration and constructs the limiter it describes.
    pub fn build(
        &self,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        app_prefix: &str,
    ) -> Result<Arc<dyn RateLimiter>> {
        self.validate()?;
        let limiter: Arc<dyn RateLimiter> = match self {
            LimiterConfig::FixedWindow(c) => {
                Arc::new(FixedWindowLimiter::new(store, app_prefix, c.clone()))
            }
            LimiterConfig::TokenBucket(c) => {
                Arc::new(TokenBucketLimiter::new(store, clock, app_prefix, c.clone()))
            }
            LimiterConfig::LeakyBucket(c) => {
                Arc::new(LeakyBucketLimiter::new(store, clock, app_prefix, c.clone()))
            }
            LimiterConfig::SlidingWindow(c) => {
                Arc::new(SlidingWindowLimiter::new(store, clock, app_prefix, c.clone()))
            }
        };
        Ok(limiter)
    }
}
