use idempotency_engine::idempotency::InMemoryStore;
use idempotency_engine::observability::{
    mask_sensitive, DependencyHealth, HealthChecker, HealthStatus, LatencyTimer, LogConfig,
    LogFormat, Metrics,
};
use std::sync::Arc;

#[test]
fn test_log_config_default() {
    let config = LogConfig::default();
    assert_eq!(config.level, "info");
    assert_eq!(config.format, LogFormat::Pretty);
    assert!(config.include_target);
    assert!(!config.include_file);
    assert!(!config.include_line);
}

#[test]
fn test_log_format_from_str() {
    assert_eq!(LogFormat::from("json"), LogFormat::Json);
    assert_eq!(LogFormat::from("COMPACT"), LogFormat::Compact);
    assert_eq!(LogFormat::from("unknown"), LogFormat::Pretty);
}

#[test]
fn test_mask_sensitive_exact_boundary() {
    assert_eq!(mask_sensitive("1234", 2), "****");
}

#[test]
fn test_mask_sensitive_hides_identity_part() {
    let masked = mask_sensitive("order-2026-0001|tenant-acme", 4);
    assert!(!masked.contains("tenant"));
    assert!(masked.starts_with("orde"));
}

#[test]
fn test_metrics_idempotency_recording() {
    let metrics = Metrics::new();
    metrics.record_idempotency_outcome("new");
    metrics.record_idempotency_outcome("replayed");
    metrics.record_idempotency_rollback();
    metrics.record_idempotency_cleanup(12);
    metrics.record_store_latency("postgres", "reserve", 3.5);
}

#[test]
fn test_metrics_http_request() {
    let metrics = Metrics::new();
    metrics.record_http_request("GET", "/health", 200, 5.0);
    metrics.record_http_request("POST", "/orders", 201, 50.0);
    metrics.record_http_request("POST", "/orders", 409, 2.0);
}

#[test]
fn test_latency_timer() {
    let timer = LatencyTimer::new();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let elapsed = timer.elapsed_ms();
    assert!(elapsed >= 10.0);
}

#[test]
fn test_dependency_health_healthy() {
    let health = DependencyHealth::healthy("store:memory", 0.2);
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.latency_ms, Some(0.2));
    assert!(health.message.is_none());
}

#[test]
fn test_health_status_serialization() {
    assert_eq!(serde_json::to_string(&HealthStatus::Healthy).unwrap(), "\"healthy\"");
    assert_eq!(serde_json::to_string(&HealthStatus::Degraded).unwrap(), "\"degraded\"");
    assert_eq!(serde_json::to_string(&HealthStatus::Unhealthy).unwrap(), "\"unhealthy\"");
}

#[test]
fn test_dependency_health_serialization() {
    let health = DependencyHealth::unhealthy("store:postgres", "Probe timeout");
    let json = serde_json::to_string(&health).unwrap();

    assert!(json.contains("\"name\":\"store:postgres\""));
    assert!(json.contains("\"status\":\"unhealthy\""));
    assert!(json.contains("\"latency_ms\":null"));
}

#[tokio::test]
async fn test_health_checker_uptime_and_readiness() {
    let checker = HealthChecker::new(Arc::new(InMemoryStore::new()));
    assert!(checker.is_ready().await);
    assert!(checker.uptime_seconds() < 5);
}
