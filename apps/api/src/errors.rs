use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::llm_client::LlmError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::Llm(e) => llm_status(e),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

fn llm_status(e: &LlmError) -> (StatusCode, &'static str, String) {
    match e {
        e if e.is_hard_cap() => (StatusCode::TOO_MANY_REQUESTS, "LLM_QUOTA_EXCEEDED", e.to_string()),
        LlmError::Throttled { .. } => (StatusCode::TOO_MANY_REQUESTS, "LLM_THROTTLED", e.to_string()),
        LlmError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, "LLM_RATE_LIMITED", e.to_string()),
        LlmError::Unauthorized(_) => {
            tracing::error!("LLM credentials rejected: {e}");
            (
                StatusCode::BAD_GATEWAY,
                "LLM_AUTH_ERROR",
                "The AI provider rejected our credentials".to_string(),
            )
        }
        LlmError::ServiceUnavailable(_) => (StatusCode::BAD_GATEWAY, "LLM_UNAVAILABLE", e.to_string()),
        _ => (
            StatusCode::BAD_GATEWAY,
            "LLM_ERROR",
            "An AI processing error occurred".to_string(),
        ),
    }
}
