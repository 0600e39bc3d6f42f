use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::idempotency::IdempotencyStore;

const STORE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STORE_SLOW_THRESHOLD_MS: f64 = 100.0;

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, latency_ms: f64, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: Some(latency_ms),
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Probes the idempotency store backing the middleware.
pub struct HealthChecker {
    store: Arc<dyn IdempotencyStore>,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            start_time: Instant::now(),
        }
    }

    pub async fn check_store(&self) -> DependencyHealth {
        let name = format!("store:{}", self.store.name());
        let start = Instant::now();

        match tokio::time::timeout(STORE_PROBE_TIMEOUT, self.store.health_check()).await {
            Ok(Ok(())) => {
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                if latency > STORE_SLOW_THRESHOLD_MS {
                    DependencyHealth::degraded(name, latency, "High latency detected")
                } else {
                    DependencyHealth::healthy(name, latency)
                }
            }
            Ok(Err(e)) => DependencyHealth::unhealthy(name, format!("Probe failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy(name, "Probe timeout"),
        }
    }

    /// Ready when the store answers, even if slowly.
    pub async fn is_ready(&self) -> bool {
        !self.check_store().await.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::InMemoryStore;

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Healthy.is_unhealthy());
        assert!(!HealthStatus::Degraded.is_healthy());
        assert!(HealthStatus::Unhealthy.is_unhealthy());
        assert_eq!(HealthStatus::Degraded.as_str(), "degraded");
    }

    #[test]
    fn test_dependency_health_constructors() {
        let degraded = DependencyHealth::degraded("store:postgres", 150.0, "slow");
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert_eq!(degraded.message, Some("slow".to_string()));

        let unhealthy = DependencyHealth::unhealthy("store:postgres", "down");
        assert_eq!(unhealthy.status, HealthStatus::Unhealthy);
        assert!(unhealthy.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_memory_store_is_ready() {
        let checker = HealthChecker::new(Arc::new(InMemoryStore::new()));
        let health = checker.check_store().await;
        assert_eq!(health.name, "store:memory");
        assert!(health.status.is_healthy());
        assert!(checker.is_ready().await);
    }
}
