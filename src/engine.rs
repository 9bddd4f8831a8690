//! Admission engine.
//!
//! One check walks `route -> handle ready -> execute`, with a single
//! reload-and-retry when the store has lost the procedure. Any other store
//! failure is resolved by the configured [`FailureMode`] instead of being
//! surfaced to the caller.

use crate::algorithms::{Algorithm, ProcedureReply, QuotaPolicy};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::key_router::{KeyRouter, QuotaKey};
use crate::metrics::MetricsCollector;
use crate::registry::ScriptRegistry;
use crate::store::{QuotaStore, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// What to decide when the store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Admit the request. A store outage never throttles traffic to zero.
    #[default]
    Open,
    /// Reject the request.
    Closed,
}

/// How a check was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Rejected,
    FailOpen,
    FailClosed,
}

/// Result of one admission check. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionOutcome {
    pub allowed: bool,
    /// `None` when the store could not be consulted.
    pub remaining_quota: Option<f64>,
    pub algorithm: Algorithm,
    pub decision: Decision,
    /// Set on rejections the store decided.
    pub retry_after_secs: Option<u64>,
}

pub struct AdmissionEngine {
    store: Arc<dyn QuotaStore>,
    registry: Arc<ScriptRegistry>,
    router: KeyRouter,
    metrics: MetricsCollector,
    clock: Arc<dyn Clock>,
    failure_mode: FailureMode,
}

impl AdmissionEngine {
    /// Creates an engine with its own registry, the default key router, the
    /// system clock and fail-open behavior.
    pub fn new(store: Arc<dyn QuotaStore>, metrics: MetricsCollector) -> Self {
        let registry = Arc::new(ScriptRegistry::new(store.clone(), metrics.clone()));
        Self {
            store,
            registry,
            router: KeyRouter::default(),
            metrics,
            clock: Arc::new(SystemClock),
            failure_mode: FailureMode::default(),
        }
    }

    pub fn with_router(mut self, router: KeyRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn router(&self) -> &KeyRouter {
        &self.router
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Uploads the procedures of `algorithms` ahead of the first check.
    pub async fn preload(&self, algorithms: &[Algorithm]) -> Result<()> {
        self.registry.preload(algorithms).await
    }

    /// Decides whether one request against `key` may proceed under `policy`.
    pub async fn check(&self, key: &QuotaKey, policy: &dyn QuotaPolicy) -> AdmissionOutcome {
        let algorithm = policy.algorithm();
        let started = Instant::now();

        let partition = self.router.partition_for(key);
        debug!(key = %key, partition, algorithm = %algorithm, "Checking quota");

        let now = self.clock.now_seconds();
        let args = policy.script_args(now);
        // The store's placement answer is observability only and never
        // delays the decision beyond the execution itself.
        let (placement, result) = tokio::join!(
            self.store.partition_for(key.as_str()),
            self.execute(algorithm, key, &args)
        );
        self.verify_placement(algorithm, key, partition, placement).await;

        let outcome = match result {
            Ok(reply) => Self::outcome_from_reply(algorithm, policy, &reply, now),
            Err(err) => self.apply_failure_mode(algorithm, key, err).await,
        };

        self.metrics
            .record_check(
                algorithm,
                key.as_str(),
                outcome.decision,
                outcome.remaining_quota,
                started.elapsed(),
            )
            .await;

        match outcome.decision {
            Decision::Allowed => debug!(
                key = %key,
                algorithm = %algorithm,
                remaining = ?outcome.remaining_quota,
                "Request allowed"
            ),
            Decision::Rejected => info!(
                key = %key,
                algorithm = %algorithm,
                remaining = ?outcome.remaining_quota,
                "Rate limit exceeded"
            ),
            Decision::FailOpen | Decision::FailClosed => {}
        }

        outcome
    }

    async fn execute(
        &self,
        algorithm: Algorithm,
        key: &QuotaKey,
        args: &[String],
    ) -> StoreResult<ProcedureReply> {
        let handle = self.registry.ensure_loaded(algorithm).await?;

        match self.store.execute(&handle, key.as_str(), args).await {
            Err(StoreError::ScriptMissing) => {
                self.registry.invalidate_stale(algorithm, &handle).await;
                let handle = self.registry.ensure_loaded(algorithm).await?;
                // A second miss is returned as-is and handled as a store error.
                self.store.execute(&handle, key.as_str(), args).await
            }
            result => result,
        }
    }

    async fn verify_placement(
        &self,
        algorithm: Algorithm,
        key: &QuotaKey,
        partition: u16,
        placement: StoreResult<u16>,
    ) {
        match placement {
            Ok(store_partition) if store_partition != partition => {
                self.metrics.record_placement_mismatch(algorithm).await;
                warn!(
                    key = %key,
                    partition,
                    store_partition,
                    "Key router and store disagree on key placement"
                );
            }
            Ok(_) => {}
            Err(err) => debug!(key = %key, error = %err, "Store did not report key placement"),
        }
    }

    fn outcome_from_reply(
        algorithm: Algorithm,
        policy: &dyn QuotaPolicy,
        reply: &ProcedureReply,
        now: u64,
    ) -> AdmissionOutcome {
        let (decision, retry_after_secs) = if reply.allowed {
            (Decision::Allowed, None)
        } else {
            (Decision::Rejected, Some(policy.retry_after_secs(reply, now)))
        };
        AdmissionOutcome {
            allowed: reply.allowed,
            remaining_quota: Some(policy.remaining_quota(reply)),
            algorithm,
            decision,
            retry_after_secs,
        }
    }

    async fn apply_failure_mode(
        &self,
        algorithm: Algorithm,
        key: &QuotaKey,
        err: StoreError,
    ) -> AdmissionOutcome {
        self.metrics.record_store_error(algorithm, err.kind()).await;

        let (allowed, decision) = match self.failure_mode {
            FailureMode::Open => (true, Decision::FailOpen),
            FailureMode::Closed => (false, Decision::FailClosed),
        };

        error!(
            key = %key,
            algorithm = %algorithm,
            error = %err,
            error_kind = err.kind(),
            failure_mode = ?self.failure_mode,
            allowed,
            "Store error during quota check"
        );

        AdmissionOutcome {
            allowed,
            remaining_quota: None,
            algorithm,
            decision,
            retry_after_secs: None,
        }
    }
}
