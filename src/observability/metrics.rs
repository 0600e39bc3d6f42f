use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::error::{AppError, Result};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Facade over the `metrics` recorder. Calls are no-ops until a recorder is installed.
#[derive(Debug, Clone, Default)]
pub struct Metrics;

impl Metrics {
    pub fn new() -> Self {
        Self
    }

    pub fn record_idempotency_outcome(&self, outcome: &'static str) {
        counter!("idempotency_requests_total", "outcome" => outcome).increment(1);
    }

    pub fn record_idempotency_rollback(&self) {
        counter!("idempotency_rollbacks_total").increment(1);
    }

    pub fn record_idempotency_cleanup(&self, removed: u64) {
        counter!("idempotency_cleanup_removed_total").increment(removed);
    }

    pub fn record_store_latency(
        &self,
        store: &'static str,
        operation: &'static str,
        duration_ms: f64,
    ) {
        histogram!("idempotency_store_duration_ms", "store" => store, "operation" => operation)
            .record(duration_ms);
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        counter!(
            "http_requests_total",
            "method" => method.to_string(),
            "path" => path.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        histogram!(
            "http_request_duration_ms",
            "method" => method.to_string(),
            "path" => path.to_string()
        )
        .record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| {
            AppError::Internal(anyhow::anyhow!("failed to install Prometheus recorder: {}", e))
        })?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!(
        "idempotency_requests_total",
        Unit::Count,
        "Guarded requests by reservation outcome"
    );
    describe_counter!(
        "idempotency_rollbacks_total",
        Unit::Count,
        "Reservations released after a persistence failure"
    );
    describe_counter!(
        "idempotency_cleanup_removed_total",
        Unit::Count,
        "Expired records removed by the sweep"
    );
    describe_histogram!(
        "idempotency_store_duration_ms",
        Unit::Milliseconds,
        "Store call latency in milliseconds"
    );

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!(
        "http_request_duration_ms",
        Unit::Milliseconds,
        "HTTP request latency in milliseconds"
    );
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
