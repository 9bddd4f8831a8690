use crate::algorithms::Algorithm;
use crate::registry::ScriptRegistry;
use crate::store::QuotaStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: ServiceStatus,
    pub scripts_loaded: Vec<Algorithm>,
    pub scripts_missing: Vec<Algorithm>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Reports healthy only when the store answers and every enabled
/// algorithm has a loaded procedure.
pub struct HealthChecker {
    store: Arc<dyn QuotaStore>,
    registry: Arc<ScriptRegistry>,
    enabled: Vec<Algorithm>,
    started: Instant,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        registry: Arc<ScriptRegistry>,
        enabled: Vec<Algorithm>,
    ) -> Self {
        Self {
            store,
            registry,
            enabled,
            started: Instant::now(),
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let store = self.check_store().await;
        let scripts_loaded = self.registry.loaded().await;
        let scripts_missing: Vec<Algorithm> = self
            .enabled
            .iter()
            .copied()
            .filter(|algorithm| !scripts_loaded.contains(algorithm))
            .collect();

        let status = if store.status == "healthy" && scripts_missing.is_empty() {
            "healthy"
        } else {
            "unhealthy"
        };

        HealthStatus {
            status: status.to_string(),
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            store,
            scripts_loaded,
            scripts_missing,
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let start = Instant::now();
        let result = self.store.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(err) => ServiceStatus {
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(err.to_string()),
            },
        }
    }
}
