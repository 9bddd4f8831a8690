use crate::algorithms::{Algorithm, SlidingWindowParams, TokenBucketParams};
use crate::error::{AdmissionError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Per-algorithm limits applied to every caller identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LimitsConfig {
    #[validate(nested)]
    pub token_bucket: TokenBucketSettings,
    #[validate(nested)]
    pub sliding_window: SlidingWindowSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_token_bucket"))]
pub struct TokenBucketSettings {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub capacity: u64,
    /// Tokens added per second.
    #[validate(range(exclusive_min = 0.0))]
    pub refill_rate: f64,
    #[validate(range(min = 1))]
    pub cost: u64,
    /// Zero derives the TTL from the time a full refill takes.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for TokenBucketSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 5,
            refill_rate: 1.0,
            cost: 1,
            ttl: Duration::from_secs(10),
        }
    }
}

impl TokenBucketSettings {
    pub fn params(&self) -> TokenBucketParams {
        TokenBucketParams::new(self.capacity, self.refill_rate, self.cost, self.ttl.as_secs())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_sliding_window"))]
pub struct SlidingWindowSettings {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[validate(range(min = 1))]
    pub max_requests: u64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for SlidingWindowSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            max_requests: 10,
            ttl: Duration::from_secs(120),
        }
    }
}

impl SlidingWindowSettings {
    pub fn params(&self) -> SlidingWindowParams {
        SlidingWindowParams::new(self.window.as_secs(), self.max_requests, self.ttl.as_secs())
    }
}

fn validate_token_bucket(settings: &TokenBucketSettings) -> std::result::Result<(), ValidationError> {
    if settings.cost > settings.capacity {
        return Err(ValidationError::new("cost_exceeds_capacity")
            .with_message("token bucket cost cannot exceed its capacity".into()));
    }
    Ok(())
}

fn validate_sliding_window(
    settings: &SlidingWindowSettings,
) -> std::result::Result<(), ValidationError> {
    if settings.window.as_secs() == 0 {
        return Err(ValidationError::new("window_too_small")
            .with_message("sliding window must be at least one second".into()));
    }
    // The previous window's counts must still exist when they are weighed.
    if settings.ttl < settings.window {
        return Err(ValidationError::new("ttl_shorter_than_window")
            .with_message("sliding window ttl must be at least the window size".into()));
    }
    Ok(())
}

impl LimitsConfig {
    /// Reads limits from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AdmissionError::Config(format!("failed to read {}: {}", path.display(), err))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let limits: Self = serde_json::from_str(raw)
            .map_err(|err| AdmissionError::Config(format!("invalid limits: {}", err)))?;
        limits.validate()?;
        Ok(limits)
    }

    pub fn is_enabled(&self, algorithm: Algorithm) -> bool {
        match algorithm {
            Algorithm::TokenBucket => self.token_bucket.enabled,
            Algorithm::SlidingWindowCounter => self.sliding_window.enabled,
        }
    }

    pub fn enabled_algorithms(&self) -> Vec<Algorithm> {
        Algorithm::ALL
            .into_iter()
            .filter(|&algorithm| self.is_enabled(algorithm))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let limits = LimitsConfig::default();
        assert!(limits.validate().is_ok());
        assert_eq!(limits.token_bucket.params(), TokenBucketParams::default());
        assert_eq!(limits.sliding_window.params(), SlidingWindowParams::default());
        assert_eq!(limits.enabled_algorithms(), Algorithm::ALL.to_vec());
    }

    #[test]
    fn test_partial_json_with_humantime_durations() {
        let limits = LimitsConfig::from_json(
            r#"{
                "token_bucket": { "capacity": 20, "refill_rate": 2.5, "ttl": "30s" },
                "sliding_window": { "enabled": false, "window": "1m", "ttl": "2m" }
            }"#,
        )
        .unwrap();

        assert_eq!(limits.token_bucket.capacity, 20);
        assert_eq!(limits.token_bucket.cost, 1);
        assert_eq!(limits.token_bucket.ttl, Duration::from_secs(30));
        assert_eq!(limits.sliding_window.max_requests, 10);
        assert_eq!(limits.enabled_algorithms(), vec![Algorithm::TokenBucket]);
    }

    #[test]
    fn test_cost_above_capacity_is_rejected() {
        let err = LimitsConfig::from_json(r#"{"token_bucket": {"capacity": 2, "cost": 3}}"#)
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));
    }

    #[test]
    fn test_zero_refill_rate_is_rejected() {
        let mut limits = LimitsConfig::default();
        limits.token_bucket.refill_rate = 0.0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_sliding_ttl_must_cover_window() {
        let err = LimitsConfig::from_json(r#"{"sliding_window": {"window": "60s", "ttl": "30s"}}"#)
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Validation(_)));

        let mut limits = LimitsConfig::default();
        limits.sliding_window.window = Duration::from_millis(500);
        limits.sliding_window.ttl = Duration::from_secs(1);
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        assert!(matches!(
            LimitsConfig::from_json("{not json"),
            Err(AdmissionError::Config(_))
        ));
    }
}
