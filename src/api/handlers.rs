use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use uuid::Uuid;

use crate::api::responses::{HealthResponse, OrderResponse};

use super::routes::AppState;

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.health_checker.check_store().await;

    Json(HealthResponse {
        status: store.status.as_str().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
        store,
        idempotency: state.idempotency.metrics().snapshot(),
    })
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Accepts an order. Mounted behind the idempotency middleware, so a retried
/// POST with the same `Idempotency-Key` gets the original response back.
pub async fn create_order(
    Json(order): Json<serde_json::Value>,
) -> (StatusCode, Json<OrderResponse>) {
    let response = OrderResponse {
        id: Uuid::new_v4(),
        ok: true,
        order,
        created_at: Utc::now(),
    };
    tracing::info!(order_id = %response.id, "Order accepted");

    (StatusCode::CREATED, Json(response))
}
