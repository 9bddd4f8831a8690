//! Sliding window rate limiting algorithm
//!
//! Implements a sliding window counter: two fixed windows (current and
//! previous) approximate the request count of a rolling window. The previous
//! window contributes in proportion to how much of it still overlaps the
//! rolling window ending at `now`.

use super::{parse_arg, Algorithm, ProcedureReply, QuotaPolicy};
use serde::{Deserialize, Serialize};

pub(crate) const LUA_SCRIPT: &str = include_str!("lua/sliding_window_counter.lua");

/// Parameters of one sliding window quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowParams {
    pub window_size_seconds: u64,
    pub max_requests: u64,
    pub ttl_seconds: u64,
}

impl SlidingWindowParams {
    pub fn new(window_size_seconds: u64, max_requests: u64, ttl_seconds: u64) -> Self {
        Self {
            window_size_seconds,
            max_requests,
            ttl_seconds,
        }
    }

    pub fn from_script_args(args: &[String]) -> Option<(Self, u64)> {
        let params = Self {
            window_size_seconds: parse_arg(args, 0)?,
            max_requests: parse_arg(args, 1)?,
            ttl_seconds: parse_arg(args, 3)?,
        };
        if params.window_size_seconds == 0 {
            return None;
        }
        Some((params, parse_arg(args, 2)?))
    }
}

impl Default for SlidingWindowParams {
    fn default() -> Self {
        Self::new(60, 10, 120)
    }
}

impl QuotaPolicy for SlidingWindowParams {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindowCounter
    }

    fn script_args(&self, now_seconds: u64) -> Vec<String> {
        vec![
            self.window_size_seconds.to_string(),
            self.max_requests.to_string(),
            now_seconds.to_string(),
            self.ttl_seconds.to_string(),
        ]
    }

    fn remaining_quota(&self, reply: &ProcedureReply) -> f64 {
        (self.max_requests as f64 - reply.value).max(0.0)
    }

    // Until the next window boundary, where the previous window's weight
    // starts to decay again.
    fn retry_after_secs(&self, _reply: &ProcedureReply, now_seconds: u64) -> u64 {
        let window = self.window_size_seconds.max(1);
        window - now_seconds % window
    }
}

/// Persisted counters of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    /// Index of the window `current` belongs to.
    pub window: u64,
    pub current: u64,
    pub previous: u64,
}

/// Applies one request to `state`. Mirrors `lua/sliding_window_counter.lua`.
///
/// The reply value is the weighted estimate including this request when it
/// was admitted, and the estimate that caused the rejection otherwise.
pub fn evaluate(
    state: Option<WindowState>,
    params: &SlidingWindowParams,
    now: u64,
) -> (WindowState, ProcedureReply) {
    let window_size = params.window_size_seconds;
    let index = now / window_size;

    let (mut current, previous) = match state {
        Some(stored) if stored.window == index => (stored.current, stored.previous),
        Some(stored) if stored.window + 1 == index => (0, stored.current),
        _ => (0, 0),
    };

    let elapsed_fraction = (now % window_size) as f64 / window_size as f64;
    let mut estimated = previous as f64 * (1.0 - elapsed_fraction) + current as f64;

    // Equality with the limit is a rejection.
    let allowed = estimated < params.max_requests as f64;
    if allowed {
        current += 1;
        estimated += 1.0;
    }

    (
        WindowState {
            window: index,
            current,
            previous,
        },
        ProcedureReply {
            allowed,
            value: estimated,
        },
    )
}
