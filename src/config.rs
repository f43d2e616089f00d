use crate::error::{LimiterError, Result};
use crate::middleware::FailurePolicy;
use crate::rate_limit_config::{
    Algorithm, FixedWindowConfig, LeakyBucketConfig, LimiterConfig, SlidingWindowConfig,
    TokenBucketConfig,
};
use clap::{ArgAction, Parser};
use humantime_serde::re::humantime;
use std::net::SocketAddr;
use std::time::Duration;

/// `redis_url` value selecting the in-process store.
pub const MEMORY_STORE_URL: &str = "memory://";

#[derive(Debug, Clone, Parser)]
#[command(name = "limitgate", version, about = "Rate-limited HTTP gateway backed by a shared store")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL, or `memory://` for a single-process store
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Namespace prepended to every limiter key
    #[arg(long, env = "APP_PREFIX", default_value = "limitgate")]
    pub app_prefix: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Answer admitted requests with the remaining budget instead of forwarding them
    #[arg(long, env = "RATE_LIMIT_DEBUG")]
    pub debug: bool,

    /// Whether requests pass when the store is unreachable
    #[arg(long, env = "FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::Closed)]
    pub failure_policy: FailurePolicy,

    #[arg(long, env = "RATE_LIMITER", value_enum, default_value_t = Algorithm::SlidingWindow)]
    pub limiter: Algorithm,

    /// Window limit, or bucket capacity for the bucket limiters
    #[arg(long, env = "RATE_LIMIT", default_value_t = 10)]
    pub limit: u64,

    /// Window length for the window limiters
    #[arg(long, env = "RATE_LIMIT_WINDOW", default_value = "10s", value_parser = humantime::parse_duration)]
    pub window: Duration,

    /// Refill or leak rate per second for the bucket limiters
    #[arg(long, env = "RATE_LIMIT_RATE", default_value_t = 1.0)]
    pub rate: f64,

    /// Token bucket admits while its balance is non-negative
    #[arg(long, env = "TOKEN_BUCKET_ALLOW_DEBT", default_value_t = true, action = ArgAction::Set)]
    pub allow_debt: bool,
}

impl Config {
    /// Load configuration from `.env`, the environment and the command line
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Config::try_parse().map_err(|e| LimiterError::Configuration(e.to_string()))
    }

    pub fn uses_memory_store(&self) -> bool {
        self.redis_url == MEMORY_STORE_URL
    }

    /// Limiter configuration selected by `limiter` and the shared parameters.
    pub fn limiter_config(&self) -> LimiterConfig {
        match self.limiter {
            Algorithm::FixedWindow => LimiterConfig::FixedWindow(FixedWindowConfig {
                limit: self.limit,
                window: self.window,
            }),
            Algorithm::TokenBucket => LimiterConfig::TokenBucket(TokenBucketConfig {
                capacity: self.limit,
                refill_rate: self.rate,
                allow_debt: self.allow_debt,
            }),
            Algorithm::LeakyBucket => LimiterConfig::LeakyBucket(LeakyBucketConfig {
                capacity: self.limit,
                leak_rate: self.rate,
            }),
            Algorithm::SlidingWindow => LimiterConfig::SlidingWindow(SlidingWindowConfig {
                max_requests: self.limit,
                window: self.window,
            }),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_store_url(&self.redis_url)?;
        self.limiter_config().validate()
    }
}

fn validate_store_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(LimiterError::Configuration(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if url != MEMORY_STORE_URL && !url.starts_with("redis://") && !url.starts_with("rediss://") {
        return Err(LimiterError::Configuration(format!(
            "Redis URL must start with 'redis://' or 'rediss://', or be '{}'",
            MEMORY_STORE_URL
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["limitgate"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_select_sliding_window() {
        let config = Config::try_parse_from(["limitgate", "--redis-url", "memory://"]).unwrap();
        assert_eq!(config.limiter, Algorithm::SlidingWindow);
        assert_eq!(config.failure_policy, FailurePolicy::Closed);
        assert!(config.allow_debt);
        assert_eq!(config.limiter_config(), LimiterConfig::default());
        assert!(config.uses_memory_store());
    }

    #[test]
    fn test_fixed_window_parameters() {
        let config = parse(&["--limiter", "fixed-window", "--limit", "100", "--window", "1m"]);
        assert_eq!(
            config.limiter_config(),
            LimiterConfig::FixedWindow(FixedWindowConfig {
                limit: 100,
                window: Duration::from_secs(60),
            })
        );
    }

    #[test]
    fn test_token_bucket_without_debt() {
        let config = parse(&[
            "--limiter",
            "token-bucket",
            "--rate",
            "0.5",
            "--allow-debt",
            "false",
        ]);
        match config.limiter_config() {
            LimiterConfig::TokenBucket(c) => {
                assert_eq!(c.refill_rate, 0.5);
                assert!(!c.allow_debt);
            }
            other => panic!("unexpected config: {:?}", other),
        }
    }

    #[test]
    fn test_failure_policy_flag() {
        let config = parse(&["--failure-policy", "open", "--debug"]);
        assert_eq!(config.failure_policy, FailurePolicy::Open);
        assert!(config.debug);
    }

    #[test]
    fn test_validate_store_url() {
        assert!(validate_store_url("redis://localhost:6379").is_ok());
        assert!(validate_store_url("rediss://localhost:6379").is_ok());
        assert!(validate_store_url("memory://").is_ok());
        assert!(validate_store_url("").is_err());
        assert!(validate_store_url("http://localhost:6379").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_leak_rate() {
        let config = parse(&["--limiter", "leaky-bucket", "--rate", "0"]);
        assert!(matches!(config.validate(), Err(LimiterError::Validation(_))));
    }
}
