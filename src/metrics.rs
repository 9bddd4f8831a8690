use crate::algorithms::Algorithm;
use crate::engine::Decision;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Upper bounds, in seconds, of the check latency histogram buckets.
pub const LATENCY_BUCKETS_SECONDS: [f64; 10] =
    [0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// One slot per bucket plus one for latencies above the last bound.
pub const LATENCY_HISTOGRAM_SLOTS: usize = 11;

/// Keys tracked by the remaining-quota gauge before the oldest are dropped.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 10_000;

/// Counters for one algorithm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmMetrics {
    pub total_checks: u64,
    pub allowed: u64,
    pub rejected: u64,
    pub fail_open: u64,
    pub fail_closed: u64,
    pub invalid_input: u64,
    pub latency_micros_total: u64,
    pub latency_micros_max: u64,
    /// Check counts per [`LATENCY_BUCKETS_SECONDS`] bucket, not cumulative.
    pub latency_histogram: [u64; LATENCY_HISTOGRAM_SLOTS],
    /// Store errors seen on the decision path, by [`crate::store::StoreError::kind`].
    pub store_errors: HashMap<String, u64>,
    pub script_uploads: u64,
    pub script_evictions: u64,
    /// Checks where the store placed a key on another slot than the router.
    pub placement_mismatches: u64,
}

impl AlgorithmMetrics {
    pub fn average_latency_micros(&self) -> u64 {
        if self.total_checks == 0 {
            0
        } else {
            self.latency_micros_total / self.total_checks
        }
    }
}

fn latency_bucket(latency: Duration) -> usize {
    let seconds = latency.as_secs_f64();
    LATENCY_BUCKETS_SECONDS
        .iter()
        .position(|&bound| seconds <= bound)
        .unwrap_or(LATENCY_BUCKETS_SECONDS.len())
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub since: u64,
    pub latency_buckets_seconds: Vec<f64>,
    pub algorithms: HashMap<String, AlgorithmMetrics>,
    /// Last remaining quota reported per recently seen key.
    pub remaining_quota: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy)]
struct Gauge {
    value: f64,
    // Update sequence number, used to find the least recently updated keys.
    seq: u64,
}

#[derive(Debug)]
struct MetricsState {
    algorithms: HashMap<Algorithm, AlgorithmMetrics>,
    remaining_quota: HashMap<String, Gauge>,
    gauge_seq: u64,
    since: u64,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self {
            algorithms: HashMap::new(),
            remaining_quota: HashMap::new(),
            gauge_seq: 0,
            since: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }
}

impl MetricsState {
    fn set_remaining(&mut self, key: &str, value: f64, max_keys: usize) {
        self.gauge_seq += 1;
        let seq = self.gauge_seq;
        self.remaining_quota
            .insert(key.to_string(), Gauge { value, seq });

        if self.remaining_quota.len() > max_keys {
            // Keep the keys updated within the last `max_keys / 2` updates,
            // so the next sweep is at least that many inserts away.
            let keep = (max_keys / 2).max(1) as u64;
            let oldest_kept = seq.saturating_sub(keep);
            self.remaining_quota.retain(|_, gauge| gauge.seq > oldest_kept);
        }
    }
}

/// In-process telemetry for admission checks and procedure loading.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    state: Arc<RwLock<MetricsState>>,
    max_tracked_keys: usize,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_max_tracked_keys(DEFAULT_MAX_TRACKED_KEYS)
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds the remaining-quota gauge to at most `max_tracked_keys` keys.
    pub fn with_max_tracked_keys(max_tracked_keys: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(MetricsState::default())),
            max_tracked_keys: max_tracked_keys.max(1),
        }
    }

    pub async fn record_check(
        &self,
        algorithm: Algorithm,
        key: &str,
        decision: Decision,
        remaining_quota: Option<f64>,
        latency: Duration,
    ) {
        let mut state = self.state.write().await;
        let metrics = state.algorithms.entry(algorithm).or_default();

        metrics.total_checks += 1;
        match decision {
            Decision::Allowed => metrics.allowed += 1,
            Decision::Rejected => metrics.rejected += 1,
            Decision::FailOpen => metrics.fail_open += 1,
            Decision::FailClosed => metrics.fail_closed += 1,
        }

        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        metrics.latency_micros_total = metrics.latency_micros_total.saturating_add(micros);
        metrics.latency_micros_max = metrics.latency_micros_max.max(micros);
        metrics.latency_histogram[latency_bucket(latency)] += 1;

        if let Some(remaining) = remaining_quota {
            state.set_remaining(key, remaining, self.max_tracked_keys);
        }
    }

    pub async fn record_invalid_input(&self, algorithm: Algorithm) {
        let mut state = self.state.write().await;
        state.algorithms.entry(algorithm).or_default().invalid_input += 1;
    }

    pub async fn record_store_error(&self, algorithm: Algorithm, kind: &str) {
        let mut state = self.state.write().await;
        *state
            .algorithms
            .entry(algorithm)
            .or_default()
            .store_errors
            .entry(kind.to_string())
            .or_default() += 1;
    }

    pub async fn record_script_upload(&self, algorithm: Algorithm) {
        let mut state = self.state.write().await;
        state.algorithms.entry(algorithm).or_default().script_uploads += 1;
    }

    pub async fn record_script_eviction(&self, algorithm: Algorithm) {
        let mut state = self.state.write().await;
        state.algorithms.entry(algorithm).or_default().script_evictions += 1;
    }

    pub async fn record_placement_mismatch(&self, algorithm: Algorithm) {
        let mut state = self.state.write().await;
        state.algorithms.entry(algorithm).or_default().placement_mismatches += 1;
    }

    pub async fn algorithm_metrics(&self, algorithm: Algorithm) -> AlgorithmMetrics {
        let state = self.state.read().await;
        state
            .algorithms
            .get(&algorithm)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn remaining_quota(&self, key: &str) -> Option<f64> {
        let state = self.state.read().await;
        state.remaining_quota.get(key).map(|gauge| gauge.value)
    }

    pub async fn tracked_keys(&self) -> usize {
        self.state.read().await.remaining_quota.len()
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().await;
        MetricsSnapshot {
            since: state.since,
            latency_buckets_seconds: LATENCY_BUCKETS_SECONDS.to_vec(),
            algorithms: state
                .algorithms
                .iter()
                .map(|(algorithm, metrics)| (algorithm.to_string(), metrics.clone()))
                .collect(),
            remaining_quota: state
                .remaining_quota
                .iter()
                .map(|(key, gauge)| (key.clone(), gauge.value))
                .collect(),
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = MetricsState::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_check_counts_decisions() {
        let metrics = MetricsCollector::new();
        let alg = Algorithm::TokenBucket;

        metrics
            .record_check(alg, "k", Decision::Allowed, Some(4.0), Duration::from_micros(100))
            .await;
        metrics
            .record_check(alg, "k", Decision::Rejected, Some(0.0), Duration::from_micros(300))
            .await;
        metrics
            .record_check(alg, "k", Decision::FailOpen, None, Duration::from_micros(50))
            .await;

        let m = metrics.algorithm_metrics(alg).await;
        assert_eq!(m.total_checks, 3);
        assert_eq!(m.allowed, 1);
        assert_eq!(m.rejected, 1);
        assert_eq!(m.fail_open, 1);
        assert_eq!(m.latency_micros_max, 300);
        assert_eq!(m.average_latency_micros(), 150);
        // Fail-open carries no quota reading, so the gauge keeps the last value.
        assert_eq!(metrics.remaining_quota("k").await, Some(0.0));
    }

    #[tokio::test]
    async fn test_latency_histogram_buckets() {
        let metrics = MetricsCollector::new();
        let alg = Algorithm::SlidingWindowCounter;

        for latency in [
            Duration::from_micros(500),
            Duration::from_millis(1),
            Duration::from_millis(3),
            Duration::from_millis(200),
            Duration::from_secs(2),
        ] {
            metrics
                .record_check(alg, "k", Decision::Allowed, Some(1.0), latency)
                .await;
        }

        let m = metrics.algorithm_metrics(alg).await;
        assert_eq!(m.latency_histogram, [2, 0, 1, 0, 0, 0, 0, 1, 0, 0, 1]);
        assert_eq!(m.latency_histogram.iter().sum::<u64>(), m.total_checks);
    }

    #[tokio::test]
    async fn test_remaining_quota_gauge_is_bounded() {
        let metrics = MetricsCollector::with_max_tracked_keys(4);
        let alg = Algorithm::TokenBucket;

        for i in 0..10 {
            metrics
                .record_check(alg, &format!("k{}", i), Decision::Allowed, Some(i as f64), Duration::ZERO)
                .await;
        }

        assert!(metrics.tracked_keys().await <= 4);
        assert_eq!(metrics.remaining_quota("k9").await, Some(9.0));
        assert_eq!(metrics.remaining_quota("k0").await, None);
        assert_eq!(metrics.algorithm_metrics(alg).await.total_checks, 10);
    }

    #[tokio::test]
    async fn test_store_errors_by_kind() {
        let metrics = MetricsCollector::new();
        let alg = Algorithm::SlidingWindowCounter;
        metrics.record_store_error(alg, "timeout").await;
        metrics.record_store_error(alg, "timeout").await;
        metrics.record_store_error(alg, "unavailable").await;

        let m = metrics.algorithm_metrics(alg).await;
        assert_eq!(m.store_errors["timeout"], 2);
        assert_eq!(m.store_errors["unavailable"], 1);
    }

    #[tokio::test]
    async fn test_snapshot_and_reset() {
        let metrics = MetricsCollector::new();
        metrics.record_script_upload(Algorithm::TokenBucket).await;
        metrics.record_script_eviction(Algorithm::TokenBucket).await;
        metrics.record_placement_mismatch(Algorithm::TokenBucket).await;

        let snapshot = metrics.snapshot().await;
        let tb = &snapshot.algorithms["token_bucket"];
        assert_eq!(tb.script_uploads, 1);
        assert_eq!(tb.script_evictions, 1);
        assert_eq!(tb.placement_mismatches, 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["algorithms"]["token_bucket"]["script_uploads"], 1);
        assert_eq!(json["latency_buckets_seconds"][0], 0.001);

        metrics.reset().await;
        assert!(metrics.snapshot().await.algorithms.is_empty());
    }
}
