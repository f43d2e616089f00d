pub mod algorithms;
pub mod client_ip;
pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod keys;
pub mod middleware;
pub mod rate_limit_config;
pub mod response;
pub mod server;
pub mod store;

pub use algorithms::{Decision, RateLimiter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{LimiterError, Result};
pub use middleware::{Admission, AdmissionOutcome, FailurePolicy, Gate};
pub use rate_limit_config::LimiterConfig;
pub use server::create_app;
pub use store::{Batch, MemoryStore, RedisStore, Store};
