//! Typed errors to HTTP status codes. Nothing unclassified escapes: unknown
//! failures map to `500 RUNTIME_ERROR` with a structured payload.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use lonelycat::CoreError;
use memory::MemoryError;
use sandbox::SandboxError;

pub struct ApiError {
    pub status: StatusCode,
    pub detail: serde_json::Value,
}

impl ApiError {
    pub fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: json!({"code": "NOT_FOUND", "message": what}),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: json!({"code": "INVALID_ARGUMENT", "message": message}),
        }
    }

    pub fn internal(message: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: json!({"code": "RUNTIME_ERROR", "message": message}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"detail": self.detail}))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::NotFound(what) => ApiError::not_found(&what),
            CoreError::InvalidArgument(m) => ApiError::bad_request(&m),
            CoreError::Storage(m) | CoreError::Decision(m) => ApiError::internal(&m),
        }
    }
}

impl From<MemoryError> for ApiError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::InvalidArgument(m) => ApiError::bad_request(&m),
            MemoryError::Storage(m) => ApiError::internal(&m),
            MemoryError::Serialization(e) => ApiError::internal(&e.to_string()),
        }
    }
}

impl From<SandboxError> for ApiError {
    fn from(e: SandboxError) -> Self {
        let status = match &e {
            SandboxError::PolicyDenied(_) => StatusCode::FORBIDDEN,
            SandboxError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            SandboxError::Runtime(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            status,
            detail: e.to_reason(),
        }
    }
}

impl From<executor::ExecutorError> for ApiError {
    fn from(e: executor::ExecutorError) -> Self {
        ApiError::internal(&e.to_string())
    }
}
