use crate::error::AdmissionError;

/// Validates configuration values that the type system cannot.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates a Redis URL
    pub fn validate_redis_url(url: &str) -> Result<(), AdmissionError> {
        if url.is_empty() {
            return Err(AdmissionError::Validation(
                "Redis URL cannot be empty".to_string(),
            ));
        }

        if !url.starts_with("redis://") && !url.starts_with("rediss://") {
            return Err(AdmissionError::Validation(format!(
                "Redis URL '{}' must start with 'redis://' or 'rediss://'",
                url
            )));
        }

        Ok(())
    }

    /// Validates the Redis node list. Standalone mode takes exactly one node.
    pub fn validate_redis_nodes(nodes: &[String], cluster: bool) -> Result<(), AdmissionError> {
        if nodes.is_empty() {
            return Err(AdmissionError::Validation(
                "At least one Redis node is required".to_string(),
            ));
        }

        if !cluster && nodes.len() > 1 {
            return Err(AdmissionError::Validation(format!(
                "{} Redis nodes configured without cluster mode",
                nodes.len()
            )));
        }

        nodes
            .iter()
            .try_for_each(|node| Self::validate_redis_url(node))
    }

    /// Validates a log level name
    pub fn validate_log_level(level: &str) -> Result<(), AdmissionError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&level.to_lowercase().as_str()) {
            return Err(AdmissionError::Validation(format!(
                "Invalid log level '{}'. Must be one of: {:?}",
                level, valid_levels
            )));
        }

        Ok(())
    }
}
