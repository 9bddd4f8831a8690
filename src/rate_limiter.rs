use crate::algorithms::{Algorithm, QuotaPolicy, SlidingWindowParams, TokenBucketParams};
use crate::engine::{AdmissionEngine, AdmissionOutcome};
use crate::error::{AdmissionError, Result};
use std::sync::Arc;
use tracing::warn;

/// One algorithm bound to its parameters, checked through a shared engine.
#[derive(Clone)]
pub struct RateLimiter {
    engine: Arc<AdmissionEngine>,
    policy: Arc<dyn QuotaPolicy>,
}

impl RateLimiter {
    pub fn new(engine: Arc<AdmissionEngine>, policy: Arc<dyn QuotaPolicy>) -> Self {
        Self { engine, policy }
    }

    pub fn token_bucket(engine: Arc<AdmissionEngine>, params: TokenBucketParams) -> Self {
        Self::new(engine, Arc::new(params))
    }

    pub fn sliding_window(engine: Arc<AdmissionEngine>, params: SlidingWindowParams) -> Self {
        Self::new(engine, Arc::new(params))
    }

    pub fn algorithm(&self) -> Algorithm {
        self.policy.algorithm()
    }

    pub fn policy(&self) -> &dyn QuotaPolicy {
        self.policy.as_ref()
    }

    /// Checks one request from `identity`.
    ///
    /// Only malformed input is an error. Store failures are already folded
    /// into the outcome by the engine's failure mode.
    pub async fn check(&self, identity: &str) -> Result<AdmissionOutcome> {
        let algorithm = self.algorithm();
        let key = match self.engine.router().quota_key(identity, algorithm) {
            Ok(key) => key,
            Err(err) => {
                warn!(algorithm = %algorithm, error = %err, "Rejected malformed identity");
                self.engine.metrics().record_invalid_input(algorithm).await;
                return Err(err);
            }
        };

        Ok(self.engine.check(&key, self.policy.as_ref()).await)
    }

    /// Like [`Self::check`], but turns a rejection into
    /// [`AdmissionError::RateLimitExceeded`].
    pub async fn enforce(&self, identity: &str) -> Result<AdmissionOutcome> {
        let outcome = self.check(identity).await?;
        if outcome.allowed {
            Ok(outcome)
        } else {
            Err(AdmissionError::RateLimitExceeded {
                algorithm: outcome.algorithm,
                retry_after_secs: outcome.retry_after_secs.unwrap_or(1),
            })
        }
    }

    pub async fn is_allowed(&self, identity: &str) -> bool {
        self.check(identity)
            .await
            .map(|outcome| outcome.allowed)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .finish()
    }
}
