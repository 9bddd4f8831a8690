use crate::algorithms::Algorithm;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::engine::{AdmissionEngine, FailureMode};
use crate::error::{AdmissionError, Result};
use crate::health::{HealthChecker, HealthStatus};
use crate::key_router::KeyRouter;
use crate::metrics::MetricsCollector;
use crate::rate_limit_config::LimitsConfig;
use crate::rate_limiter::RateLimiter;
use crate::store::{MemoryStore, QuotaStore, RedisStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Main admission service: owns the store connection, the shared engine and
/// one limiter per enabled algorithm.
pub struct Throttler {
    engine: Arc<AdmissionEngine>,
    token_bucket: Option<RateLimiter>,
    sliding_window: Option<RateLimiter>,
    health: HealthChecker,
}

impl Throttler {
    /// Connects to the configured store and loads every enabled procedure.
    ///
    /// Fails if the store is unreachable or rejects a procedure, so a broken
    /// instance never starts serving.
    pub async fn connect(config: &Config) -> Result<Self> {
        config.validate()?;
        let limits = config.limits()?;

        let store: Arc<dyn QuotaStore> = match config.store_backend {
            StoreBackend::Redis => Arc::new(RedisStore::connect(&config.store_options()).await?),
            StoreBackend::Memory => {
                warn!("Using in-process store; limits are not shared between instances");
                Arc::new(MemoryStore::new())
            }
        };

        let throttler = Self::from_parts(
            store,
            limits,
            KeyRouter::new(config.key_prefix.clone())?,
            Arc::new(SystemClock),
            config.failure_mode,
        );
        throttler.preload().await?;

        Ok(throttler)
    }

    /// Assembles a throttler around an existing store. Nothing is loaded yet.
    pub fn from_parts(
        store: Arc<dyn QuotaStore>,
        limits: LimitsConfig,
        router: KeyRouter,
        clock: Arc<dyn Clock>,
        failure_mode: FailureMode,
    ) -> Self {
        let metrics = MetricsCollector::new();
        let engine = Arc::new(
            AdmissionEngine::new(store.clone(), metrics)
                .with_router(router)
                .with_clock(clock)
                .with_failure_mode(failure_mode),
        );

        let token_bucket = limits
            .token_bucket
            .enabled
            .then(|| RateLimiter::token_bucket(engine.clone(), limits.token_bucket.params()));
        let sliding_window = limits
            .sliding_window
            .enabled
            .then(|| RateLimiter::sliding_window(engine.clone(), limits.sliding_window.params()));

        let health = HealthChecker::new(
            store,
            engine.registry().clone(),
            limits.enabled_algorithms(),
        );

        Self {
            engine,
            token_bucket,
            sliding_window,
            health,
        }
    }

    /// Uploads the procedures of every enabled algorithm.
    pub async fn preload(&self) -> Result<()> {
        let enabled = self.enabled_algorithms();
        self.engine.preload(&enabled).await?;
        info!(algorithms = ?enabled, "Quota procedures loaded");
        Ok(())
    }

    pub fn enabled_algorithms(&self) -> Vec<Algorithm> {
        Algorithm::ALL
            .into_iter()
            .filter(|&algorithm| self.limiter(algorithm).is_some())
            .collect()
    }

    /// The limiter for `algorithm`, or `None` when it is disabled.
    pub fn limiter(&self, algorithm: Algorithm) -> Option<&RateLimiter> {
        match algorithm {
            Algorithm::TokenBucket => self.token_bucket.as_ref(),
            Algorithm::SlidingWindowCounter => self.sliding_window.as_ref(),
        }
    }

    /// Like [`Self::limiter`], but a disabled algorithm is an error.
    pub fn require_limiter(&self, algorithm: Algorithm) -> Result<&RateLimiter> {
        self.limiter(algorithm).ok_or_else(|| {
            AdmissionError::Config(format!("{} limiting is disabled", algorithm))
        })
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    pub fn metrics(&self) -> &MetricsCollector {
        self.engine.metrics()
    }

    pub async fn health_check(&self) -> HealthStatus {
        self.health.check_health().await
    }

    /// Closes the store connection. Later checks resolve by failure mode.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.store().close().await?;
        info!("Store connection closed");
        Ok(())
    }
}
