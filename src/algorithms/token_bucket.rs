//! Token bucket algorithm
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `refill_rate` tokens per second. A request debits `cost` tokens when
//! enough are available.

use super::{parse_arg, Algorithm, ProcedureReply, QuotaPolicy};
use serde::{Deserialize, Serialize};

pub(crate) const LUA_SCRIPT: &str = include_str!("lua/token_bucket.lua");

/// Parameters of one token bucket quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketParams {
    pub capacity: u64,
    /// Tokens added per second.
    pub refill_rate: f64,
    pub cost: u64,
    pub ttl_seconds: u64,
}

impl TokenBucketParams {
    /// A zero `ttl_seconds` is replaced by the time an empty bucket needs
    /// to refill completely.
    pub fn new(capacity: u64, refill_rate: f64, cost: u64, ttl_seconds: u64) -> Self {
        let ttl_seconds = if ttl_seconds == 0 {
            Self::refill_period(capacity, refill_rate)
        } else {
            ttl_seconds
        };

        Self {
            capacity,
            refill_rate,
            cost,
            ttl_seconds,
        }
    }

    fn refill_period(capacity: u64, refill_rate: f64) -> u64 {
        if refill_rate <= 0.0 {
            return capacity.max(1);
        }
        ((capacity as f64 / refill_rate).ceil() as u64).max(1)
    }

    /// Inverse of [`QuotaPolicy::script_args`], returning the parameters
    /// and the `now` argument.
    pub fn from_script_args(args: &[String]) -> Option<(Self, u64)> {
        let params = Self {
            capacity: parse_arg(args, 0)?,
            refill_rate: parse_arg(args, 1)?,
            cost: parse_arg(args, 3)?,
            ttl_seconds: parse_arg(args, 4)?,
        };
        Some((params, parse_arg(args, 2)?))
    }
}

impl Default for TokenBucketParams {
    fn default() -> Self {
        Self::new(5, 1.0, 1, 10)
    }
}

impl QuotaPolicy for TokenBucketParams {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn script_args(&self, now_seconds: u64) -> Vec<String> {
        vec![
            self.capacity.to_string(),
            self.refill_rate.to_string(),
            now_seconds.to_string(),
            self.cost.to_string(),
            self.ttl_seconds.to_string(),
        ]
    }

    fn remaining_quota(&self, reply: &ProcedureReply) -> f64 {
        reply.value.max(0.0)
    }

    fn retry_after_secs(&self, reply: &ProcedureReply, _now_seconds: u64) -> u64 {
        let deficit = self.cost as f64 - self.remaining_quota(reply);
        if self.refill_rate <= 0.0 {
            return self.ttl_seconds.max(1);
        }
        ((deficit / self.refill_rate).ceil() as u64).max(1)
    }
}

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: u64,
}

/// Applies one request to `state`. Mirrors `lua/token_bucket.lua`.
///
/// The returned state is persisted whether or not the request was admitted,
/// so a rejection still records the refill up to `now`.
pub fn evaluate(
    state: Option<BucketState>,
    params: &TokenBucketParams,
    now: u64,
) -> (BucketState, ProcedureReply) {
    let capacity = params.capacity as f64;
    let BucketState {
        mut tokens,
        last_refill,
    } = state.unwrap_or(BucketState {
        tokens: capacity,
        last_refill: now,
    });

    let elapsed = now.saturating_sub(last_refill) as f64;
    tokens = capacity.min(tokens + elapsed * params.refill_rate);

    let cost = params.cost as f64;
    let allowed = tokens >= cost;
    if allowed {
        tokens -= cost;
    }

    (
        BucketState {
            tokens,
            last_refill: last_refill.max(now),
        },
        ProcedureReply {
            allowed,
            value: tokens,
        },
    )
}
