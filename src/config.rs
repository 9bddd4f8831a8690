use crate::config_validator::ConfigValidator;
use crate::engine::FailureMode;
use crate::error::Result;
use crate::rate_limit_config::{LimitsConfig, SlidingWindowSettings, TokenBucketSettings};
use crate::store::RedisStoreOptions;
use clap::{ArgAction, Parser, ValueEnum};
use humantime_serde::re::humantime::parse_duration;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use validator::Validate;

/// Where quota state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    Redis,
    /// Process-local state. Limits are not shared between instances.
    Memory,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "quota-gate", version, about = "Distributed per-key admission control")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: SocketAddr,

    #[arg(long, env = "STORE_BACKEND", value_enum, default_value_t = StoreBackend::Redis)]
    pub store_backend: StoreBackend,

    /// Comma-separated Redis URLs; the seed nodes in cluster mode
    #[arg(
        long,
        env = "REDIS_NODES",
        value_delimiter = ',',
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_nodes: Vec<String>,

    #[arg(long, env = "REDIS_CLUSTER", default_value_t = false, action = ArgAction::Set)]
    pub redis_cluster: bool,

    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    pub redis_password: Option<String>,

    /// Upper bound for each store round trip, e.g. "5s" or "250ms"
    #[arg(long, env = "STORE_TIMEOUT", default_value = "5s", value_parser = parse_duration)]
    pub store_timeout: Duration,

    /// Decision when the store cannot answer
    #[arg(long, env = "FAILURE_MODE", value_enum, default_value_t = FailureMode::Open)]
    pub failure_mode: FailureMode,

    #[arg(long, env = "KEY_PREFIX", default_value = "rate_limit")]
    pub key_prefix: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// JSON limits file; replaces the per-algorithm flags below when set
    #[arg(long, env = "LIMITS_FILE")]
    pub limits_file: Option<PathBuf>,

    #[arg(long, env = "TOKEN_BUCKET_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub token_bucket_enabled: bool,

    #[arg(long, env = "TOKEN_BUCKET_CAPACITY", default_value_t = 5)]
    pub token_bucket_capacity: u64,

    /// Tokens added per second
    #[arg(long, env = "TOKEN_BUCKET_REFILL_RATE", default_value_t = 1.0)]
    pub token_bucket_refill_rate: f64,

    #[arg(long, env = "TOKEN_BUCKET_COST", default_value_t = 1)]
    pub token_bucket_cost: u64,

    /// "0s" derives the TTL from the refill period
    #[arg(long, env = "TOKEN_BUCKET_TTL", default_value = "10s", value_parser = parse_duration)]
    pub token_bucket_ttl: Duration,

    #[arg(long, env = "SLIDING_WINDOW_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub sliding_window_enabled: bool,

    #[arg(long, env = "SLIDING_WINDOW_SIZE", default_value = "60s", value_parser = parse_duration)]
    pub sliding_window_size: Duration,

    #[arg(long, env = "SLIDING_WINDOW_MAX_REQUESTS", default_value_t = 10)]
    pub sliding_window_max_requests: u64,

    #[arg(long, env = "SLIDING_WINDOW_TTL", default_value = "120s", value_parser = parse_duration)]
    pub sliding_window_ttl: Duration,
}

impl Config {
    /// Loads configuration from environment variables and defaults only.
    pub fn from_env() -> std::result::Result<Self, clap::Error> {
        Self::try_parse_from(["quota-gate"])
    }

    /// Checks the values that parsing alone does not.
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_log_level(&self.log_level)?;
        if self.store_backend == StoreBackend::Redis {
            ConfigValidator::validate_redis_nodes(&self.redis_nodes, self.redis_cluster)?;
        }
        Ok(())
    }

    /// The validated limits, from the limits file when one is configured.
    pub fn limits(&self) -> Result<LimitsConfig> {
        if let Some(path) = &self.limits_file {
            return LimitsConfig::from_file(path);
        }

        let limits = LimitsConfig {
            token_bucket: TokenBucketSettings {
                enabled: self.token_bucket_enabled,
                capacity: self.token_bucket_capacity,
                refill_rate: self.token_bucket_refill_rate,
                cost: self.token_bucket_cost,
                ttl: self.token_bucket_ttl,
            },
            sliding_window: SlidingWindowSettings {
                enabled: self.sliding_window_enabled,
                window: self.sliding_window_size,
                max_requests: self.sliding_window_max_requests,
                ttl: self.sliding_window_ttl,
            },
        };
        limits.validate()?;
        Ok(limits)
    }

    pub fn store_options(&self) -> RedisStoreOptions {
        RedisStoreOptions {
            nodes: self.redis_nodes.clone(),
            cluster: self.redis_cluster,
            password: self.redis_password.clone(),
            timeout: self.store_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdmissionError;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("quota-gate").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.store_backend, StoreBackend::Redis);
        assert_eq!(config.store_timeout, Duration::from_secs(5));
        assert_eq!(config.failure_mode, FailureMode::Open);
        assert!(config.validate().is_ok());
        assert_eq!(config.limits().unwrap(), LimitsConfig::default());
    }

    #[test]
    fn test_cluster_node_list() {
        let config = parse(&[
            "--redis-nodes",
            "redis://a:6379,redis://b:6379,redis://c:6379",
            "--redis-cluster",
            "true",
            "--store-timeout",
            "250ms",
        ]);
        let options = config.store_options();
        assert_eq!(options.nodes.len(), 3);
        assert!(options.cluster);
        assert_eq!(options.timeout, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_backend_skips_node_validation() {
        let config = parse(&["--store-backend", "memory", "--redis-nodes", "nonsense"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits_flags() {
        let config = parse(&["--token-bucket-capacity", "1", "--token-bucket-cost", "2"]);
        assert!(matches!(config.limits(), Err(AdmissionError::Validation(_))));
    }

    #[test]
    fn test_algorithm_can_be_disabled() {
        let config = parse(&["--sliding-window-enabled", "false", "--failure-mode", "closed"]);
        let limits = config.limits().unwrap();
        assert!(!limits.sliding_window.enabled);
        assert_eq!(config.failure_mode, FailureMode::Closed);
    }
}
