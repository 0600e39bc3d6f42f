#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body, Bytes},
    extract::State,
    http::{Request, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use idempotency_engine::idempotency::{idempotency_middleware, IdempotencyState};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Connects to the test database, or returns `None` when `DATABASE_URL` is unset.
pub async fn setup_test_db() -> Option<PgPool> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").ok()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Some(pool)
}

/// Counts handler invocations.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

async fn create_order(State(calls): State<Calls>) -> Response {
    calls.hit();
    (
        StatusCode::CREATED,
        [("content-type", "application/json"), ("x-order-ref", "ord-1")],
        r#"{"ok":true}"#,
    )
        .into_response()
}

async fn slow_order(State(calls): State<Calls>) -> Response {
    calls.hit();
    tokio::time::sleep(Duration::from_millis(100)).await;
    (StatusCode::CREATED, r#"{"ok":true}"#).into_response()
}

async fn echo(State(calls): State<Calls>, body: Bytes) -> Response {
    calls.hit();
    (StatusCode::OK, body).into_response()
}

/// Router with a few handlers guarded by the idempotency middleware.
pub fn test_app(state: IdempotencyState, calls: Calls) -> Router {
    Router::new()
        .route("/orders", post(create_order).delete(create_order).get(create_order))
        .route("/slow", post(slow_order))
        .route("/echo", post(echo))
        .layer(middleware::from_fn_with_state(state, idempotency_middleware))
        .with_state(calls)
}

pub fn json_request(method: &str, uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub async fn body_bytes(response: Response) -> Bytes {
    to_bytes(response.into_body(), usize::MAX).await.unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
