use crate::algorithms::Algorithm;
use crate::store::StoreError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    /// Malformed caller input, e.g. an empty identity. Always fail-closed.
    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Rate limit exceeded for {algorithm}")]
    RateLimitExceeded {
        algorithm: Algorithm,
        retry_after_secs: u64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A procedure could not be registered with the store.
    #[error("Failed to load {algorithm} procedure: {source}")]
    ScriptUpload {
        algorithm: Algorithm,
        #[source]
        source: StoreError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for AdmissionError {
    fn from(err: validator::ValidationErrors) -> Self {
        AdmissionError::Validation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str, code: u16) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
            code,
        }
    }

    pub fn from_admission_error(err: &AdmissionError) -> Self {
        match err {
            AdmissionError::InvalidInput(msg) => Self::new("bad_request", msg, 400),
            AdmissionError::RateLimitExceeded { .. } => Self::new(
                "rate_limit_exceeded",
                "Rate limit exceeded. Please try again later.",
                429,
            ),
            AdmissionError::Store(_) | AdmissionError::ScriptUpload { .. } => {
                Self::new("service_unavailable", &err.to_string(), 503)
            }
            AdmissionError::Config(msg) => Self::new("configuration_error", msg, 500),
            AdmissionError::Validation(msg) => Self::new("validation_error", msg, 422),
            AdmissionError::Internal(msg) => Self::new("internal_error", msg, 500),
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let body = ErrorResponse::from_admission_error(&self);
        let status =
            StatusCode::from_u16(body.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Json(body)).into_response();

        if let AdmissionError::RateLimitExceeded {
            retry_after_secs, ..
        } = self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AdmissionError::InvalidInput("empty".into()), 400),
            (
                AdmissionError::RateLimitExceeded {
                    algorithm: Algorithm::TokenBucket,
                    retry_after_secs: 1,
                },
                429,
            ),
            (AdmissionError::Store(StoreError::Timeout), 503),
            (AdmissionError::Validation("capacity".into()), 422),
        ];

        for (err, code) in cases {
            assert_eq!(ErrorResponse::from_admission_error(&err).code, code);
            assert_eq!(err.into_response().status().as_u16(), code);
        }
    }

    #[test]
    fn test_rate_limited_response_sets_retry_after() {
        let response = AdmissionError::RateLimitExceeded {
            algorithm: Algorithm::SlidingWindowCounter,
            retry_after_secs: 60,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    }
}
