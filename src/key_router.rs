//! Quota key construction and cluster slot routing.
//!
//! Keys carry the caller identity inside a Redis Cluster hash tag
//! (`rate_limit:{user:alice}:token_bucket`), so every key derived from one
//! identity hashes to the same slot and each procedure touches one partition.

use crate::algorithms::Algorithm;
use crate::error::{AdmissionError, Result};
use redis::cluster_routing::get_slot;
use std::fmt;

const DEFAULT_PREFIX: &str = "rate_limit";

/// Canonical store key holding one caller's quota state for one algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey(String);

impl QuotaKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps caller identities to quota keys and keys to cluster slots.
#[derive(Debug, Clone)]
pub struct KeyRouter {
    prefix: String,
}

impl KeyRouter {
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.contains(&['{', '}'][..]) {
            return Err(AdmissionError::Config(format!(
                "invalid key prefix '{}': must be non-empty and contain no braces",
                prefix
            )));
        }
        Ok(Self { prefix })
    }

    /// Builds the quota key for `identity`.
    ///
    /// Distinct identities always produce distinct keys: `%`, `{` and `}` are
    /// percent-escaped so the identity can neither close the hash tag early
    /// nor collide with another escaped identity.
    pub fn quota_key(&self, identity: &str, algorithm: Algorithm) -> Result<QuotaKey> {
        if identity.trim().is_empty() {
            return Err(AdmissionError::InvalidInput(
                "caller identity cannot be empty".to_string(),
            ));
        }

        Ok(QuotaKey(format!(
            "{}:{{user:{}}}:{}",
            self.prefix,
            escape_identity(identity),
            algorithm
        )))
    }

    /// Redis Cluster hash slot of `key`, computed locally.
    pub fn partition_for(&self, key: &QuotaKey) -> u16 {
        get_slot(key.as_str().as_bytes())
    }

    /// Whether all `keys` hash to the same slot.
    pub fn colocated(keys: &[&str]) -> bool {
        let mut slots = keys.iter().map(|key| get_slot(key.as_bytes()));
        match slots.next() {
            Some(first) => slots.all(|slot| slot == first),
            None => true,
        }
    }
}

impl Default for KeyRouter {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

fn escape_identity(identity: &str) -> String {
    let mut escaped = String::with_capacity(identity.len());
    for c in identity.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            '{' => escaped.push_str("%7B"),
            '}' => escaped.push_str("%7D"),
            c => escaped.push(c),
        }
    }
    escaped
}
