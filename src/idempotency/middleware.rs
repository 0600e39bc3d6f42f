use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::api::responses::IdempotencyRejection;
use crate::error::{AppError, Result};
use crate::idempotency::clock::{Clock, SystemClock};
use crate::idempotency::fingerprint::FingerprintInput;
use crate::idempotency::identity::{resolve_identity, ExtensionIdentity, IdentityExtractor};
use crate::idempotency::record::{scoped_key, ReservationState, StoredResponse};
use crate::idempotency::store::IdempotencyStore;
use crate::observability::{get_metrics, mask_sensitive, LatencyTimer};

pub const DEFAULT_HEADER_NAME: &str = "idempotency-key";
pub const REPLAY_HEADER: &str = "x-idempotent-replay";
pub const DEFAULT_TTL_SECONDS: i64 = 86_400;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers never replayed verbatim; length is recomputed from the stored body.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Per-instance counters for idempotency handling.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub new_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub in_progress_rejections: AtomicU64,
    pub conflict_rejections: AtomicU64,
    pub store_errors: AtomicU64,
    pub rollbacks: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, counter: &AtomicU64, outcome: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome(outcome);
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.record(&self.new_requests, "new");
    }

    pub fn record_replay(&self) {
        self.record(&self.replayed_requests, "replayed");
    }

    pub fn record_in_progress(&self) {
        self.record(&self.in_progress_rejections, "in_progress");
    }

    pub fn record_conflict(&self) {
        self.record(&self.conflict_rejections, "conflict");
    }

    pub fn record_store_error(&self) {
        self.record(&self.store_errors, "store_error");
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_rollback();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            in_progress_rejections: self.in_progress_rejections.load(Ordering::Relaxed),
            conflict_rejections: self.conflict_rejections.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub new_requests: u64,
    pub replayed_requests: u64,
    pub in_progress_rejections: u64,
    pub conflict_rejections: u64,
    pub store_errors: u64,
    pub rollbacks: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Middleware options, built once at startup.
#[derive(Clone)]
pub struct IdempotencyConfig {
    pub header_name: HeaderName,
    pub ttl: Duration,
    pub guarded_methods: Vec<Method>,
    pub max_body_bytes: usize,
    /// Upper bound on each store call; `None` waits for the store.
    pub store_timeout: Option<std::time::Duration>,
    pub clock: Arc<dyn Clock>,
    pub identity: Arc<dyn IdentityExtractor>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: HeaderName::from_static(DEFAULT_HEADER_NAME),
            ttl: Duration::seconds(DEFAULT_TTL_SECONDS),
            guarded_methods: vec![Method::POST, Method::PUT, Method::PATCH, Method::DELETE],
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            store_timeout: None,
            clock: Arc::new(SystemClock),
            identity: Arc::new(ExtensionIdentity),
        }
    }
}

impl fmt::Debug for IdempotencyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyConfig")
            .field("header_name", &self.header_name)
            .field("ttl", &self.ttl)
            .field("guarded_methods", &self.guarded_methods)
            .field("max_body_bytes", &self.max_body_bytes)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl IdempotencyConfig {
    pub fn with_header_name(mut self, header_name: HeaderName) -> Self {
        self.header_name = header_name;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_guarded_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.guarded_methods = methods.into_iter().collect();
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn with_store_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_identity_extractor(mut self, identity: Arc<dyn IdentityExtractor>) -> Self {
        self.identity = identity;
        self
    }

    pub fn guards(&self, method: &Method) -> bool {
        self.guarded_methods.contains(method)
    }
}

/// Shared middleware state: the injected store plus its configuration.
#[derive(Clone)]
pub struct IdempotencyState {
    store: Arc<dyn IdempotencyStore>,
    config: Arc<IdempotencyConfig>,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyState {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let timer = LatencyTimer::new();
        let result = match self.config.store_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(AppError::Timeout(operation))),
            None => call.await,
        };
        get_metrics().record_store_latency(self.store.name(), operation, timer.elapsed_ms());
        result
    }

    /// Runs the reserve → execute → persist protocol for a guarded request.
    async fn handle(
        &self,
        request: Request,
        next: Next,
    ) -> std::result::Result<Response, IdempotencyRejection> {
        self.metrics.record_request();
        let (parts, body) = request.into_parts();

        let key = parts
            .headers
            .get(&self.config.header_name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or(IdempotencyRejection::KeyRequired)?;

        let body = to_bytes(body, self.config.max_body_bytes)
            .await
            .map_err(|_| IdempotencyRejection::BodyTooLarge)?;

        let identity = resolve_identity(self.config.identity.as_ref(), &parts);
        let fingerprint = FingerprintInput::from_parts(&parts, &identity, &body).digest();
        let key = scoped_key(&key, &identity);
        let masked_key = mask_sensitive(&key, 4);

        let now = self.config.clock.now();
        let reservation = match self
            .bounded("reserve", self.store.reserve(&key, &fingerprint, now, self.config.ttl))
            .await
        {
            Ok(reservation) => reservation,
            Err(e) if e.is_fingerprint_mismatch() => {
                tracing::warn!(
                    key = %masked_key,
                    "Idempotency key reused with a different request"
                );
                self.metrics.record_conflict();
                return Err(IdempotencyRejection::KeyConflict);
            }
            Err(e) => {
                tracing::error!(key = %masked_key, error = %e, "Failed to reserve idempotency key");
                self.metrics.record_store_error();
                return Err(IdempotencyRejection::StoreError);
            }
        };

        match reservation.state {
            ReservationState::Pending => {
                tracing::debug!(key = %masked_key, "Idempotent request still in progress");
                self.metrics.record_in_progress();
                Err(IdempotencyRejection::InProgress)
            }
            ReservationState::Completed => match reservation.record.response() {
                Some(stored) => {
                    tracing::debug!(
                        key = %masked_key,
                        status = stored.status,
                        "Replaying stored response"
                    );
                    self.metrics.record_replay();
                    Ok(replay_response(stored))
                }
                None => {
                    tracing::error!(
                        key = %masked_key,
                        "Completed idempotency record has no response data"
                    );
                    Err(IdempotencyRejection::UnknownState)
                }
            },
            ReservationState::New => {
                self.metrics.record_new();
                let request = Request::from_parts(parts, Body::from(body));
                let guard = ReservationGuard::new(self, &key, &fingerprint);
                let result = self
                    .execute(&key, &masked_key, &fingerprint, request, next)
                    .await;
                guard.disarm();
                result
            }
        }
    }

    async fn execute(
        &self,
        key: &str,
        masked_key: &str,
        fingerprint: &str,
        request: Request,
        next: Next,
    ) -> std::result::Result<Response, IdempotencyRejection> {
        let (parts, body) = next.run(request).await.into_parts();

        let body = match to_bytes(body, usize::MAX).await {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(key = %masked_key, error = %e, "Failed to buffer handler response");
                self.rollback(key, masked_key, fingerprint).await;
                return Err(IdempotencyRejection::StoreError);
            }
        };

        let snapshot = StoredResponse::from_parts(parts.status, &parts.headers, body.to_vec());
        let now = self.config.clock.now();
        let saved = self
            .bounded(
                "save_response",
                self.store
                    .save_response(key, fingerprint, &snapshot, now, self.config.ttl),
            )
            .await;

        match saved {
            Ok(()) => Ok(Response::from_parts(parts, Body::from(body))),
            Err(e) => {
                tracing::error!(
                    key = %masked_key,
                    error = %e,
                    "Failed to persist idempotent response"
                );
                self.metrics.record_store_error();
                self.rollback(key, masked_key, fingerprint).await;
                Err(IdempotencyRejection::StoreError)
            }
        }
    }

    /// Best-effort release so the key does not stay pending forever.
    async fn rollback(&self, key: &str, masked_key: &str, fingerprint: &str) {
        self.metrics.record_rollback();
        if let Err(e) = self
            .bounded("release", self.store.release(key, fingerprint))
            .await
        {
            tracing::error!(
                key = %masked_key,
                error = %e,
                "Failed to release idempotency reservation"
            );
        }
    }
}

/// Releases a fresh reservation when the request future is dropped before the
/// handler outcome is persisted or rolled back, as happens on client disconnect.
struct ReservationGuard {
    store: Arc<dyn IdempotencyStore>,
    metrics: Arc<IdempotencyMetrics>,
    key: String,
    fingerprint: String,
    armed: bool,
}

impl ReservationGuard {
    fn new(state: &IdempotencyState, key: &str, fingerprint: &str) -> Self {
        Self {
            store: state.store(),
            metrics: state.metrics(),
            key: key.to_string(),
            fingerprint: fingerprint.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let masked_key = mask_sensitive(&self.key, 4);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %masked_key, "No runtime to release abandoned reservation");
            return;
        };

        self.metrics.record_rollback();
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let fingerprint = std::mem::take(&mut self.fingerprint);
        runtime.spawn(async move {
            match store.release(&key, &fingerprint).await {
                Ok(()) => tracing::debug!(key = %masked_key, "Released abandoned reservation"),
                Err(e) => tracing::error!(
                    key = %masked_key,
                    error = %e,
                    "Failed to release abandoned reservation"
                ),
            }
        });
    }
}

/// Rebuilds a stored response for replay and marks it as such.
fn replay_response(stored: StoredResponse) -> Response {
    let mut headers: HeaderMap = stored.header_map();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(stored.body.len()));
    headers.insert(REPLAY_HEADER, HeaderValue::from_static("true"));

    let status = stored.status_code();
    let mut response = Response::new(Body::from(stored.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Axum middleware guarding mutating routes.
///
/// Install with `axum::middleware::from_fn_with_state(state, idempotency_middleware)`.
pub async fn idempotency_middleware(
    State(state): State<IdempotencyState>,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.guards(request.method()) {
        return next.run(request).await;
    }

    match state.handle(request, next).await {
        Ok(response) => response,
        Err(rejection) => rejection.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = IdempotencyMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_new();
        metrics.record_replay();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.new_requests, 1);
        assert_eq!(snapshot.replayed_requests, 1);
        assert_eq!(snapshot.replay_rate(), 0.5);
    }

    #[test]
    fn test_default_config() {
        let config = IdempotencyConfig::default();
        assert_eq!(config.header_name.as_str(), "idempotency-key");
        assert_eq!(config.ttl, Duration::hours(24));
        assert!(config.guards(&Method::POST));
        assert!(config.guards(&Method::DELETE));
        assert!(!config.guards(&Method::GET));
        assert!(!config.guards(&Method::HEAD));
        assert!(config.store_timeout.is_none());
    }

    #[test]
    fn test_replay_strips_hop_by_hop_headers() {
        let stored = StoredResponse::new(
            201,
            vec![
                ("content-type".to_string(), vec!["application/json".to_string()]),
                ("content-length".to_string(), vec!["999".to_string()]),
                ("transfer-encoding".to_string(), vec!["chunked".to_string()]),
                ("connection".to_string(), vec!["close".to_string()]),
            ],
            b"{\"ok\":true}".to_vec(),
        );

        let response = replay_response(stored);
        assert_eq!(response.status(), StatusCode::CREATED);
        let headers = response.headers();
        assert_eq!(headers.get(REPLAY_HEADER).unwrap(), "true");
        assert_eq!(headers.get(header::CONTENT_LENGTH).unwrap(), "11");
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
    }
}
