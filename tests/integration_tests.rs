use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use quota_gate::{
    algorithms::Algorithm,
    clock::ManualClock,
    create_app,
    engine::{Decision, FailureMode},
    handlers::AppState,
    key_router::KeyRouter,
    rate_limit_config::LimitsConfig,
    store::MemoryStore,
    AdmissionError, Throttler,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;

struct Harness {
    throttler: Arc<Throttler>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

async fn harness_with(limits: LimitsConfig, failure_mode: FailureMode) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    let throttler = Throttler::from_parts(
        store.clone(),
        limits,
        KeyRouter::default(),
        clock.clone(),
        failure_mode,
    );
    assert_ok!(throttler.preload().await);

    Harness {
        throttler: Arc::new(throttler),
        store,
        clock,
    }
}

async fn harness() -> Harness {
    harness_with(LimitsConfig::default(), FailureMode::Open).await
}

#[tokio::test]
async fn test_token_bucket_burst_then_refill() {
    let h = harness().await;
    let limiter = h.throttler.require_limiter(Algorithm::TokenBucket).unwrap();

    let mut remaining = Vec::new();
    for _ in 0..5 {
        let outcome = limiter.check("u1").await.unwrap();
        assert!(outcome.allowed);
        remaining.push(outcome.remaining_quota.unwrap());
    }
    assert_eq!(remaining, vec![4.0, 3.0, 2.0, 1.0, 0.0]);

    let outcome = limiter.check("u1").await.unwrap();
    assert!(!outcome.allowed);
    assert_eq!(outcome.decision, Decision::Rejected);

    h.clock.set(5);
    let outcome = limiter.check("u1").await.unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.remaining_quota, Some(4.0));
}

#[tokio::test]
async fn test_sliding_window_weighs_previous_window() {
    let h = harness().await;
    let limiter = h
        .throttler
        .require_limiter(Algorithm::SlidingWindowCounter)
        .unwrap();

    for i in 0..10 {
        h.clock.set(i);
        assert!(limiter.is_allowed("u1").await);
    }
    h.clock.set(30);
    assert!(!limiter.is_allowed("u1").await);

    // Halfway into the next window the previous ten weigh five.
    h.clock.set(90);
    let outcome = limiter.check("u1").await.unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.remaining_quota, Some(4.0));
}

#[tokio::test]
async fn test_identities_are_isolated() {
    let mut limits = LimitsConfig::default();
    limits.token_bucket.capacity = 1;
    let h = harness_with(limits, FailureMode::Open).await;
    let limiter = h.throttler.require_limiter(Algorithm::TokenBucket).unwrap();

    assert!(limiter.is_allowed("alice").await);
    assert!(!limiter.is_allowed("alice").await);
    assert!(limiter.is_allowed("bob").await);
    assert!(limiter.is_allowed("a{lice}").await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_never_overadmit() {
    let mut limits = LimitsConfig::default();
    limits.token_bucket.capacity = 10;
    limits.token_bucket.refill_rate = 0.001;
    limits.token_bucket.ttl = Duration::from_secs(60);
    let h = harness_with(limits, FailureMode::Open).await;

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let throttler = h.throttler.clone();
            tokio::spawn(async move {
                throttler
                    .require_limiter(Algorithm::TokenBucket)
                    .unwrap()
                    .is_allowed("shared")
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        if task.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 10);

    let metrics = h
        .throttler
        .metrics()
        .algorithm_metrics(Algorithm::TokenBucket)
        .await;
    assert_eq!(metrics.total_checks, 50);
    assert_eq!(metrics.rejected, 40);
}

#[tokio::test]
async fn test_store_outage_fails_open_and_is_counted() {
    let h = harness().await;
    let limiter = h.throttler.require_limiter(Algorithm::TokenBucket).unwrap();
    h.store.set_available(false);

    let outcome = limiter.check("u1").await.unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.decision, Decision::FailOpen);

    let metrics = h
        .throttler
        .metrics()
        .algorithm_metrics(Algorithm::TokenBucket)
        .await;
    assert_eq!(metrics.fail_open, 1);
    assert_eq!(metrics.store_errors["unavailable"], 1);
}

#[tokio::test]
async fn test_fail_closed_mode_rejects_during_outage() {
    let h = harness_with(LimitsConfig::default(), FailureMode::Closed).await;
    let limiter = h
        .throttler
        .require_limiter(Algorithm::SlidingWindowCounter)
        .unwrap();
    h.store.set_available(false);

    let outcome = limiter.check("u1").await.unwrap();
    assert!(!outcome.allowed);
    assert_eq!(outcome.decision, Decision::FailClosed);
}

#[tokio::test]
async fn test_flushed_procedures_are_reloaded_transparently() {
    let h = harness().await;
    let limiter = h.throttler.require_limiter(Algorithm::TokenBucket).unwrap();
    assert!(limiter.is_allowed("u1").await);
    assert_eq!(h.store.upload_count(), 2);

    h.store.flush_scripts();
    let outcome = limiter.check("u1").await.unwrap();
    assert_eq!(outcome.decision, Decision::Allowed);
    assert_eq!(outcome.remaining_quota, Some(3.0));
    assert_eq!(h.store.upload_count(), 3);
}

#[tokio::test]
async fn test_empty_identity_is_rejected_before_the_store() {
    let h = harness().await;
    let limiter = h.throttler.require_limiter(Algorithm::TokenBucket).unwrap();

    let err = assert_err!(limiter.check("").await);
    assert!(matches!(err, AdmissionError::InvalidInput(_)));
    assert!(h.store.bucket_state("rate_limit:{user:}:token_bucket").is_none());
}

fn app(h: &Harness) -> axum::Router {
    create_app(Arc::new(AppState::with_instance_name(
        h.throttler.clone(),
        "node-1",
    )))
}

fn get(uri: &str, user_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(user_id) = user_id {
        builder = builder.header("user_id", user_id);
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_http_admits_and_reports_instance() {
    let h = harness().await;
    let response = app(&h)
        .oneshot(get("/token-bucket", Some("u1")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-remaining"], "4");
    let body = json_body(response).await;
    assert_eq!(body["message"], "Request allowed");
    assert_eq!(body["handled_by"], "node-1");
}

#[tokio::test]
async fn test_http_missing_user_id_is_bad_request() {
    let h = harness().await;
    let response = app(&h)
        .oneshot(get("/sliding-window-counter", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "bad_request");

    let metrics = h
        .throttler
        .metrics()
        .algorithm_metrics(Algorithm::SlidingWindowCounter)
        .await;
    assert_eq!(metrics.invalid_input, 1);
}

#[tokio::test]
async fn test_http_rejection_sets_retry_after() {
    let mut limits = LimitsConfig::default();
    limits.token_bucket.capacity = 1;
    limits.token_bucket.refill_rate = 0.5;
    let h = harness_with(limits, FailureMode::Open).await;
    let app = app(&h);

    let first = app
        .clone()
        .oneshot(get("/token-bucket", Some("u1")))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(get("/token-bucket", Some("u1"))).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers()[header::RETRY_AFTER], "2");
}

#[tokio::test]
async fn test_http_disabled_algorithm_is_not_found() {
    let mut limits = LimitsConfig::default();
    limits.sliding_window.enabled = false;
    let h = harness_with(limits, FailureMode::Open).await;

    let response = app(&h)
        .oneshot(get("/sliding-window-counter", Some("u1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_http_health_tracks_store() {
    let h = harness().await;

    let response = app(&h).oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(
        body["scripts_loaded"],
        serde_json::json!(["token_bucket", "sliding_window_counter"])
    );

    h.store.set_available(false);
    let response = app(&h).oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_http_metrics_snapshot() {
    let h = harness().await;
    let app = app(&h);
    app.clone()
        .oneshot(get("/token-bucket", Some("u1")))
        .await
        .unwrap();

    let response = app.oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["algorithms"]["token_bucket"]["allowed"], 1);
    assert_eq!(body["algorithms"]["token_bucket"]["script_uploads"], 1);
    assert_eq!(body["remaining_quota"]["rate_limit:{user:u1}:token_bucket"], 4.0);
}
