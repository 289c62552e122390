// Jaskier Shared Pattern -- error
// Typed error taxonomy shared by every core subsystem. Library-level
// functions in the mesh/AAP/router never throw these across a fan-out
// boundary (they fold failures into result-shaped values instead) — this
// type exists for the outer HTTP boundary and for components (HITL, task
// manager) whose own contracts carry an error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("cancelled")]
    Cancelled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MeshError {
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::NotFound(_) => "NOT_FOUND",
            MeshError::Validation(_) => "VALIDATION",
            MeshError::Timeout(_) => "TIMEOUT",
            MeshError::Connection(_) => "CONNECTION",
            MeshError::Cancelled => "CANCELLED",
            MeshError::Conflict(_) => "CONFLICT",
            MeshError::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        let status = match &self {
            MeshError::NotFound(_) => StatusCode::NOT_FOUND,
            MeshError::Validation(_) => StatusCode::BAD_REQUEST,
            MeshError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            MeshError::Connection(_) => StatusCode::BAD_GATEWAY,
            MeshError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            MeshError::Conflict(_) => StatusCode::CONFLICT,
            MeshError::Internal(_) => {
                tracing::error!(error = %self, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
