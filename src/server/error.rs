use crate::engine::EngineError;
use crate::flows::FlowsError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Boundary error: an HTTP status plus a message body. Domain errors map
/// onto 400/404/409; anything unexpected in the store is a 500.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let err = err.normalize();
        let status = match &err {
            EngineError::Flows(FlowsError::InvalidName { .. }) => StatusCode::BAD_REQUEST,
            EngineError::Flows(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::FlowUnavailable { .. } => StatusCode::BAD_REQUEST,
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::Conflict { .. } => StatusCode::CONFLICT,
            EngineError::StepNotRetryable { .. } => StatusCode::CONFLICT,
            EngineError::Store(StoreError::InvalidColumn { .. }) => StatusCode::BAD_REQUEST,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::from(EngineError::from(err))
    }
}
