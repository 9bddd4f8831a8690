use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::algorithms::Algorithm;
use crate::error::{AdmissionError, ErrorResponse};
use crate::throttler::Throttler;

/// Header carrying the caller identity.
pub const USER_ID_HEADER: &str = "user_id";

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub throttler: Arc<Throttler>,
    /// Reported in admitted responses so callers can tell instances apart.
    pub handled_by: String,
}

impl AppState {
    pub fn new(throttler: Arc<Throttler>) -> Self {
        let handled_by = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
        Self::with_instance_name(throttler, handled_by)
    }

    pub fn with_instance_name(throttler: Arc<Throttler>, handled_by: impl Into<String>) -> Self {
        Self {
            throttler,
            handled_by: handled_by.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdmittedResponse {
    pub message: String,
    pub handled_by: String,
}

pub async fn token_bucket(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    admit(&state, Algorithm::TokenBucket, &headers).await
}

pub async fn sliding_window_counter(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Response {
    admit(&state, Algorithm::SlidingWindowCounter, &headers).await
}

async fn admit(state: &AppState, algorithm: Algorithm, headers: &HeaderMap) -> Response {
    let Some(limiter) = state.throttler.limiter(algorithm) else {
        let body = ErrorResponse::new(
            "not_found",
            &format!("{} limiting is disabled", algorithm),
            404,
        );
        return (StatusCode::NOT_FOUND, Json(body)).into_response();
    };

    let result = match caller_identity(headers) {
        Ok(identity) => limiter.enforce(identity).await,
        Err(err) => {
            state.throttler.metrics().record_invalid_input(algorithm).await;
            Err(err)
        }
    };

    match result {
        Ok(outcome) => {
            let mut response = Json(AdmittedResponse {
                message: "Request allowed".to_string(),
                handled_by: state.handled_by.clone(),
            })
            .into_response();

            if let Some(remaining) = outcome.remaining_quota {
                response.headers_mut().insert(
                    "x-ratelimit-remaining",
                    HeaderValue::from(remaining.floor() as u64),
                );
            }
            response
        }
        Err(err) => err.into_response(),
    }
}

fn caller_identity(headers: &HeaderMap) -> Result<&str, AdmissionError> {
    let value = headers.get(USER_ID_HEADER).ok_or_else(|| {
        AdmissionError::InvalidInput(format!("missing '{}' header", USER_ID_HEADER))
    })?;

    value.to_str().map_err(|_| {
        AdmissionError::InvalidInput(format!("'{}' header is not valid text", USER_ID_HEADER))
    })
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.throttler.health_check().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

pub async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    Json(state.throttler.metrics().snapshot().await)
}
