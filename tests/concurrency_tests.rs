use async_trait::async_trait;
use limitgate::{
    rate_limit_config::{FixedWindowConfig, LeakyBucketConfig, TokenBucketConfig},
    store::BatchReplies,
    Batch, LimiterConfig, ManualClock, MemoryStore, RateLimiter, Store,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

const START: i64 = 1_700_000_000_000;
const CALLERS: usize = 20;

/// Hands control back to the scheduler before every batch, so concurrent
/// checks interleave between store round trips the way they do over a network.
struct YieldingStore {
    inner: MemoryStore,
}

#[async_trait]
impl Store for YieldingStore {
    async fn exec(&self, batch: &Batch) -> limitgate::Result<BatchReplies> {
        tokio::task::yield_now().await;
        self.inner.exec(batch).await
    }

    async fn ping(&self) -> limitgate::Result<()> {
        self.inner.ping().await
    }
}

fn yielding_limiter(config: LimiterConfig) -> Arc<dyn RateLimiter> {
    let clock = Arc::new(ManualClock::new(START));
    let store: Arc<dyn Store> = Arc::new(YieldingStore {
        inner: MemoryStore::new(clock.clone()),
    });
    config.build(store, clock, "test").unwrap()
}

async fn admitted_concurrently(limiter: Arc<dyn RateLimiter>) -> usize {
    let mut tasks = JoinSet::new();
    for _ in 0..CALLERS {
        let limiter = limiter.clone();
        tasks.spawn(async move { limiter.check("k").await.unwrap().allowed });
    }

    let mut admitted = 0;
    while let Some(allowed) = tasks.join_next().await {
        if allowed.unwrap() {
            admitted += 1;
        }
    }
    admitted
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fixed_window_concurrent_callers_share_one_limit() {
    let limiter = yielding_limiter(LimiterConfig::FixedWindow(FixedWindowConfig {
        limit: 5,
        window: Duration::from_secs(60),
    }));
    assert_eq!(admitted_concurrently(limiter).await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_token_bucket_concurrent_callers_share_one_bucket() {
    let limiter = yielding_limiter(LimiterConfig::TokenBucket(TokenBucketConfig {
        capacity: 5,
        refill_rate: 1.0,
        allow_debt: false,
    }));
    assert_eq!(admitted_concurrently(limiter).await, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_token_bucket_debt_is_borrowed_once_under_contention() {
    let limiter = yielding_limiter(LimiterConfig::TokenBucket(TokenBucketConfig {
        capacity: 5,
        refill_rate: 1.0,
        allow_debt: true,
    }));
    assert_eq!(admitted_concurrently(limiter).await, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leaky_bucket_concurrent_callers_share_one_level() {
    let limiter = yielding_limiter(LimiterConfig::LeakyBucket(LeakyBucketConfig {
        capacity: 5,
        leak_rate: 1.0,
    }));
    assert_eq!(admitted_concurrently(limiter).await, 5);
}
