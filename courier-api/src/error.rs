use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use courier_core::EngineError;
use serde_json::json;

/// HTTP rendering of [`EngineError`]. Every handler returns this, so error
/// bodies share one shape: `{ok: false, error: {code, message}}`.
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError(EngineError::Internal(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Gone(_) => StatusCode::GONE,
            EngineError::Exhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Database(_) | EngineError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // 5xx details go to the log, never to the client.
        let message = if status.is_server_error() {
            tracing::error!("API error: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        let body = json!({
            "ok": false,
            "error": { "code": self.0.code(), "message": message },
        });
        (status, Json(body)).into_response()
    }
}
