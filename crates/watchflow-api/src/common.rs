//! Error mapping and shared response helpers

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use watchflow_engine::EngineError;

/// API-facing error wrapper mapping engine errors to status codes
pub struct ApiError(pub EngineError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::Validation(_) | EngineError::InvalidWebhookToken => {
                StatusCode::BAD_REQUEST
            }
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) | EngineError::AlreadyRunning(_) => StatusCode::CONFLICT,
            EngineError::SignatureMismatch => StatusCode::UNAUTHORIZED,
            EngineError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError(e)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
