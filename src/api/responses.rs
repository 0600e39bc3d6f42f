use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::idempotency::MetricsSnapshot;
use crate::observability::DependencyHealth;

/// JSON error envelope returned by the idempotency layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

/// Terminal outcomes of the idempotency middleware that never reach the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdempotencyRejection {
    #[error("the Idempotency-Key header is required for this request")]
    KeyRequired,

    #[error("a request with this idempotency key is still being processed, retry later")]
    InProgress,

    #[error("this idempotency key was already used for a different request")]
    KeyConflict,

    #[error("the idempotency store could not record this request, retry with the same key")]
    StoreError,

    #[error("the stored idempotency record is in an unexpected state")]
    UnknownState,

    #[error("the request body exceeds the size the idempotency layer can buffer")]
    BodyTooLarge,
}

impl IdempotencyRejection {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::KeyRequired => StatusCode::BAD_REQUEST,
            Self::InProgress | Self::KeyConflict => StatusCode::CONFLICT,
            Self::StoreError | Self::UnknownState => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::KeyRequired => "idempotency_key_required",
            Self::InProgress => "idempotency_in_progress",
            Self::KeyConflict => "idempotency_key_conflict",
            Self::StoreError => "idempotency_store_error",
            Self::UnknownState => "idempotency_unknown_state",
            Self::BodyTooLarge => "idempotency_body_too_large",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string())
    }
}

impl IntoResponse for IdempotencyRejection {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub store: DependencyHealth,
    pub idempotency: MetricsSnapshot,
}

/// Order accepted by the demo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub ok: bool,
    pub order: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
