use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use kube::core::DynamicObject;
use kube::core::admission::AdmissionReview;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::admission::{AdmissionAdapter, decode_review};
use crate::audit::AdmissionAuditLogger;
use crate::error::DecodeError;

/// Shared application state
pub struct AppState {
    pub adapter: Arc<AdmissionAdapter>,
    pub audit: Arc<AdmissionAuditLogger>,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: u32,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.code {
            400 => StatusCode::BAD_REQUEST,
            503 => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<DecodeError> for ApiError {
    fn from(e: DecodeError) -> Self {
        ApiError {
            error: e.to_string(),
            code: 400,
        }
    }
}

// === Health ===

/// Probe status
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

/// Liveness probe
pub async fn healthz() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// Readiness probe; fails once shutdown has begun so the API server stops routing to us
pub async fn readyz(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthStatus>, ApiError> {
    if state.adapter.is_shutting_down() {
        return Err(ApiError {
            error: "shutting down".to_string(),
            code: 503,
        });
    }
    Ok(Json(HealthStatus { status: "ok" }))
}

// === Admission ===

/// Mutate a Pod admission review
pub async fn mutate(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<AdmissionReview<DynamicObject>>, ApiError> {
    let req = decode_review(&body).inspect_err(|e| {
        warn!(error = %e, "Rejecting malformed admission review");
        state.audit.request_malformed("-", &e.to_string());
    })?;

    let response = state.adapter.admit(&req).await;
    Ok(Json(response.into_review()))
}
