pub mod algorithms;
pub mod clock;
pub mod config;
pub mod config_validator;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_router;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod rate_limiter;
pub mod registry;
pub mod server;
pub mod store;
pub mod throttler;

pub use algorithms::{Algorithm, QuotaPolicy, SlidingWindowParams, TokenBucketParams};
pub use config::Config;
pub use engine::{AdmissionEngine, AdmissionOutcome, Decision, FailureMode};
pub use error::{AdmissionError, Result};
pub use key_router::{KeyRouter, QuotaKey};
pub use rate_limiter::RateLimiter;
pub use server::create_app;
pub use store::{MemoryStore, QuotaStore, RedisStore, StoreError};
pub use throttler::Throttler;
