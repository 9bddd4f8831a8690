//! Quota script registry.
//!
//! Keeps one procedure handle per algorithm. Concurrent first use of an
//! algorithm is coalesced behind a per-slot gate so the store sees a single
//! upload; later callers read the cached handle without touching the gate.

use crate::algorithms::Algorithm;
use crate::error::{AdmissionError, Result};
use crate::metrics::MetricsCollector;
use crate::store::{QuotaStore, ScriptHandle, StoreResult};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

#[derive(Default)]
struct Slot {
    handle: RwLock<Option<ScriptHandle>>,
    // Held for the duration of an upload.
    gate: Mutex<()>,
}

pub struct ScriptRegistry {
    store: Arc<dyn QuotaStore>,
    metrics: MetricsCollector,
    token_bucket: Slot,
    sliding_window: Slot,
}

impl ScriptRegistry {
    pub fn new(store: Arc<dyn QuotaStore>, metrics: MetricsCollector) -> Self {
        Self {
            store,
            metrics,
            token_bucket: Slot::default(),
            sliding_window: Slot::default(),
        }
    }

    fn slot(&self, algorithm: Algorithm) -> &Slot {
        match algorithm {
            Algorithm::TokenBucket => &self.token_bucket,
            Algorithm::SlidingWindowCounter => &self.sliding_window,
        }
    }

    /// The cached handle, if any, without loading.
    pub async fn cached(&self, algorithm: Algorithm) -> Option<ScriptHandle> {
        self.slot(algorithm).handle.read().await.clone()
    }

    /// Returns the cached handle, uploading the procedure on a miss.
    ///
    /// Upload failures are returned unchanged and are not retried.
    pub async fn ensure_loaded(&self, algorithm: Algorithm) -> StoreResult<ScriptHandle> {
        let slot = self.slot(algorithm);
        if let Some(handle) = slot.handle.read().await.clone() {
            return Ok(handle);
        }

        let _gate = slot.gate.lock().await;
        // Another caller may have finished the upload while we waited.
        if let Some(handle) = slot.handle.read().await.clone() {
            return Ok(handle);
        }

        let handle = self
            .store
            .upload_procedure(&algorithm.procedure())
            .await
            .map_err(|err| {
                error!(algorithm = %algorithm, error = %err, "Failed to upload procedure");
                err
            })?;

        *slot.handle.write().await = Some(handle.clone());
        self.metrics.record_script_upload(algorithm).await;
        info!(algorithm = %algorithm, handle = %handle, "Procedure loaded");

        Ok(handle)
    }

    /// Clears the cached handle so the next [`Self::ensure_loaded`] uploads again.
    pub async fn invalidate(&self, algorithm: Algorithm) -> Option<ScriptHandle> {
        let previous = self.slot(algorithm).handle.write().await.take();
        if previous.is_some() {
            self.metrics.record_script_eviction(algorithm).await;
            warn!(algorithm = %algorithm, "Procedure handle invalidated");
        }
        previous
    }

    /// Clears the cached handle only if it is still `stale`.
    ///
    /// Callers that observed the same eviction concurrently then trigger at
    /// most one reload between them. Returns whether the slot was cleared.
    pub async fn invalidate_stale(&self, algorithm: Algorithm, stale: &ScriptHandle) -> bool {
        let cleared = {
            let mut handle = self.slot(algorithm).handle.write().await;
            if handle.as_ref() == Some(stale) {
                *handle = None;
                true
            } else {
                false
            }
        };

        if cleared {
            self.metrics.record_script_eviction(algorithm).await;
            warn!(algorithm = %algorithm, handle = %stale, "Store evicted procedure, reloading");
        }
        cleared
    }

    /// Loads every algorithm in `algorithms`, failing on the first upload error.
    pub async fn preload(&self, algorithms: &[Algorithm]) -> Result<()> {
        for &algorithm in algorithms {
            self.ensure_loaded(algorithm)
                .await
                .map_err(|source| AdmissionError::ScriptUpload { algorithm, source })?;
        }
        Ok(())
    }

    pub async fn is_loaded(&self, algorithm: Algorithm) -> bool {
        self.cached(algorithm).await.is_some()
    }

    pub async fn loaded(&self) -> Vec<Algorithm> {
        let mut loaded = Vec::new();
        for algorithm in Algorithm::ALL {
            if self.is_loaded(algorithm).await {
                loaded.push(algorithm);
            }
        }
        loaded
    }
}
