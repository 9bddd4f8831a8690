//! In-process store backend.
//!
//! Runs the Rust models of the quota procedures under a single mutex, which
//! gives the same per-key atomicity Redis gives the Lua bodies. Useful for
//! local development without Redis and for exercising the engine's failure
//! paths (evicted procedures, outages, slow uploads).

use super::{QuotaStore, ScriptHandle, StoreError, StoreResult};
use crate::algorithms::{
    sliding_window, token_bucket, Algorithm, BucketState, Procedure, ProcedureReply,
    SlidingWindowParams, TokenBucketParams, WindowState,
};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
struct Expiring<T> {
    state: T,
    expires_at: u64,
}

impl<T: Copy> Expiring<T> {
    /// Current state under `key`, dropping the entry once its TTL has passed.
    fn live(map: &mut HashMap<String, Self>, key: &str, now: u64) -> Option<T> {
        match map.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.state),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }
}

/// Seconds of store time between two sweeps of expired keys.
const SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<ScriptHandle, Algorithm>,
    buckets: HashMap<String, Expiring<BucketState>>,
    windows: HashMap<String, Expiring<WindowState>>,
    last_sweep: u64,
}

impl Inner {
    /// Drops every expired key, at most once per [`SWEEP_INTERVAL_SECS`].
    fn sweep_expired(&mut self, now: u64) {
        if now < self.last_sweep.saturating_add(SWEEP_INTERVAL_SECS) {
            return;
        }
        self.buckets.retain(|_, entry| entry.expires_at > now);
        self.windows.retain(|_, entry| entry.expires_at > now);
        self.last_sweep = now;
    }
}

/// Quota store kept entirely in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
    uploads: AtomicUsize,
    upload_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            uploads: AtomicUsize::new(0),
            upload_delay: None,
        }
    }

    /// Makes every upload wait for `delay` before it completes.
    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    /// Number of procedure uploads served so far.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Forgets every uploaded procedure, like `SCRIPT FLUSH` or a restart.
    pub fn flush_scripts(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.scripts.clear();
        }
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn bucket_state(&self, key: &str) -> Option<BucketState> {
        let inner = self.inner.lock().ok()?;
        inner.buckets.get(key).map(|entry| entry.state)
    }

    pub fn window_state(&self, key: &str) -> Option<WindowState> {
        let inner = self.inner.lock().ok()?;
        inner.windows.get(key).map(|entry| entry.state)
    }

    /// Number of quota keys currently held, expired or not.
    pub fn key_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.buckets.len() + inner.windows.len())
            .unwrap_or(0)
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn handle_for(procedure: &Procedure) -> ScriptHandle {
        let mut hasher = DefaultHasher::new();
        procedure.body.hash(&mut hasher);
        ScriptHandle::new(format!("{:016x}", hasher.finish()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_args(algorithm: Algorithm) -> StoreError {
    StoreError::Protocol(format!("invalid arguments for {}", algorithm))
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.ensure_available()
    }

    async fn upload_procedure(&self, procedure: &Procedure) -> StoreResult<ScriptHandle> {
        self.ensure_available()?;
        if let Some(delay) = self.upload_delay {
            tokio::time::sleep(delay).await;
        }

        let handle = Self::handle_for(procedure);
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        inner.scripts.insert(handle.clone(), procedure.algorithm);
        self.uploads.fetch_add(1, Ordering::SeqCst);

        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &ScriptHandle,
        key: &str,
        args: &[String],
    ) -> StoreResult<ProcedureReply> {
        self.ensure_available()?;
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;

        let algorithm = *inner
            .scripts
            .get(handle)
            .ok_or(StoreError::ScriptMissing)?;

        match algorithm {
            Algorithm::TokenBucket => {
                let (params, now) =
                    TokenBucketParams::from_script_args(args).ok_or_else(|| invalid_args(algorithm))?;
                inner.sweep_expired(now);
                let current = Expiring::live(&mut inner.buckets, key, now);
                let (state, reply) = token_bucket::evaluate(current, &params, now);
                inner.buckets.insert(
                    key.to_string(),
                    Expiring {
                        state,
                        expires_at: now + params.ttl_seconds,
                    },
                );
                Ok(reply)
            }
            Algorithm::SlidingWindowCounter => {
                let (params, now) = SlidingWindowParams::from_script_args(args)
                    .ok_or_else(|| invalid_args(algorithm))?;
                inner.sweep_expired(now);
                let current = Expiring::live(&mut inner.windows, key, now);
                let (state, reply) = sliding_window::evaluate(current, &params, now);
                inner.windows.insert(
                    key.to_string(),
                    Expiring {
                        state,
                        expires_at: now + params.ttl_seconds,
                    },
                );
                Ok(reply)
            }
        }
    }

    async fn close(&self) -> StoreResult<()> {
        self.set_available(false);
        Ok(())
    }
}
