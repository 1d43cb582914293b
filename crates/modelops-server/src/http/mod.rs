mod events;
pub mod metrics;
mod routes;

pub use metrics::ModelOpsMetrics;
pub use routes::create_router;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use modelops_core::{ModelOps, ModelOpsError};
use serde::Serialize;
use std::sync::Arc;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ops: Arc<ModelOps>,
    pub metrics: Arc<ModelOpsMetrics>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(ops: Arc<ModelOps>, metrics: Arc<ModelOpsMetrics>) -> Self {
        Self {
            ops,
            metrics,
            start_time: std::time::Instant::now(),
        }
    }
}

/// JSON response wrapper
#[derive(Serialize)]
pub struct JsonResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> JsonResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> JsonResponse<()> {
        JsonResponse {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Status code for a core error.
pub fn status_for(err: &ModelOpsError) -> StatusCode {
    if err.is_not_found() {
        return StatusCode::NOT_FOUND;
    }
    match err {
        ModelOpsError::Validation(_)
        | ModelOpsError::InvalidArtifact(_)
        | ModelOpsError::ThresholdNotMet { .. }
        | ModelOpsError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ModelOpsError::InvalidTransition { .. }
        | ModelOpsError::AlreadyRunning(_)
        | ModelOpsError::PlanState { .. } => StatusCode::CONFLICT,
        ModelOpsError::ModelNotAvailable(_) | ModelOpsError::NoHealthyInstance { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ModelOpsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ModelOpsError::Inference(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Custom error type for HTTP handlers
pub struct AppError(anyhow::Error);

impl AppError {
    pub fn status(&self) -> StatusCode {
        self.0
            .downcast_ref::<ModelOpsError>()
            .map(status_for)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        (status, Json(JsonResponse::<()>::err(self.0.to_string()))).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type AppResult<T> = Result<T, AppError>;
