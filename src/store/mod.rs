//! Shared store client contract.
//!
//! The admission engine only needs a store that can hold uploaded procedures
//! and execute them atomically against one key. [`RedisStore`] talks to a
//! standalone or clustered Redis; [`MemoryStore`] runs the same procedures
//! in-process.

pub mod memory;
pub mod redis;

use crate::algorithms::{Procedure, ProcedureReply};
use async_trait::async_trait;
use ::redis::cluster_routing::get_slot;
use std::fmt;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RedisStoreOptions};

/// Content-derived identifier of an uploaded procedure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failures reported by a [`QuotaStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store no longer knows the procedure handle (evicted or restarted).
    #[error("procedure handle unknown to the store")]
    ScriptMissing,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("store protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::ScriptMissing => "script_missing",
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Timeout => "timeout",
            StoreError::Protocol(_) => "protocol",
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A replicated key-value store with server-side atomic procedures.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    /// Uploads a procedure body and returns the handle to invoke it with.
    async fn upload_procedure(&self, procedure: &Procedure) -> StoreResult<ScriptHandle>;

    /// Runs a previously uploaded procedure against `key`.
    ///
    /// Must return [`StoreError::ScriptMissing`] when `handle` is unknown.
    async fn execute(
        &self,
        handle: &ScriptHandle,
        key: &str,
        args: &[String],
    ) -> StoreResult<ProcedureReply>;

    /// Partition (cluster hash slot) the store places `key` on.
    ///
    /// Stores without partitions report the slot a cluster would use.
    async fn partition_for(&self, key: &str) -> StoreResult<u16> {
        Ok(get_slot(key.as_bytes()))
    }

    async fn close(&self) -> StoreResult<()>;
}

pub(crate) fn parse_reply(allowed: i64, value: &str) -> StoreResult<ProcedureReply> {
    let value = value
        .parse::<f64>()
        .map_err(|e| StoreError::Protocol(format!("invalid counter value '{}': {}", value, e)))?;

    Ok(ProcedureReply {
        allowed: allowed == 1,
        value,
    })
}
