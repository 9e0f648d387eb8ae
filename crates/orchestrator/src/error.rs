use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mesh_core::fedavg::FedAvgError;
use serde_json::json;

use crate::rounds::DispatchResult;

/// Caller-facing error taxonomy. Every variant maps to exactly one HTTP
/// status; fan-out failures carry the full per-endpoint diagnostic list.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("{message}")]
    AllNodesFailed {
        message: String,
        results: Vec<DispatchResult>,
    },

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::AllNodesFailed { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            ApiError::AllNodesFailed { message, results } => {
                json!({ "message": message, "results": results })
            }
            other => json!(other.to_string()),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<FedAvgError> for ApiError {
    fn from(e: FedAvgError) -> Self {
        ApiError::Validation(e.to_string())
    }
}
