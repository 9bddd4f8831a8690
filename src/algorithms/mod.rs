//! Rate limiting algorithms module
//!
//! Each algorithm ships a Lua procedure that the shared store executes
//! atomically, plus a Rust model of the same arithmetic used by the
//! in-process store and by tests.

pub mod sliding_window;
pub mod token_bucket;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use sliding_window::{SlidingWindowParams, WindowState};
pub use token_bucket::{BucketState, TokenBucketParams};

/// The admission algorithms known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindowCounter,
}

impl Algorithm {
    pub const ALL: [Algorithm; 2] = [Algorithm::TokenBucket, Algorithm::SlidingWindowCounter];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindowCounter => "sliding_window_counter",
        }
    }

    /// The procedure body uploaded to the store for this algorithm.
    pub fn procedure(&self) -> Procedure {
        let body = match self {
            Algorithm::TokenBucket => token_bucket::LUA_SCRIPT,
            Algorithm::SlidingWindowCounter => sliding_window::LUA_SCRIPT,
        };
        Procedure {
            algorithm: *self,
            body,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic procedure body together with the algorithm it implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Procedure {
    pub algorithm: Algorithm,
    pub body: &'static str,
}

/// Reply of one procedure execution: the decision and the counter value
/// the algorithm reports (tokens left, or the weighted request estimate).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcedureReply {
    pub allowed: bool,
    pub value: f64,
}

/// One quota check capability: turns the current time into ordered
/// procedure arguments and reads the remaining quota back from a reply.
pub trait QuotaPolicy: Send + Sync + fmt::Debug {
    fn algorithm(&self) -> Algorithm;

    /// Arguments passed to the procedure after the key, in `ARGV` order.
    fn script_args(&self, now_seconds: u64) -> Vec<String>;

    /// Remaining quota for the key after the decision in `reply`.
    fn remaining_quota(&self, reply: &ProcedureReply) -> f64;

    /// Seconds a rejected caller should wait before retrying. Never zero.
    fn retry_after_secs(&self, reply: &ProcedureReply, now_seconds: u64) -> u64;
}

pub(crate) fn parse_arg<T: std::str::FromStr>(args: &[String], index: usize) -> Option<T> {
    args.get(index).and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names_are_stable() {
        assert_eq!(Algorithm::TokenBucket.to_string(), "token_bucket");
        assert_eq!(
            serde_json::to_string(&Algorithm::SlidingWindowCounter).unwrap(),
            "\"sliding_window_counter\""
        );
    }

    #[test]
    fn test_procedure_bodies_differ() {
        let tb = Algorithm::TokenBucket.procedure();
        let sw = Algorithm::SlidingWindowCounter.procedure();
        assert_ne!(tb.body, sw.body);
        assert!(tb.body.contains("last_refill"));
        assert!(sw.body.contains("previous"));
    }
}
