//! Mapping of [`AppError`] to HTTP responses.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::AppError;

/// Seconds a client should wait before retrying after a 429.
pub const RETRY_AFTER_SECONDS: u64 = 60;

/// An API failure: a coordinator error plus the generic message used when
/// the error is not one the caller can act on.
#[derive(Debug)]
pub struct ApiError {
    error: AppError,
    fallback: &'static str,
}

impl ApiError {
    /// Wrap `error`, reporting `fallback` for 500s.
    #[must_use]
    pub fn new(error: AppError, fallback: &'static str) -> Self {
        Self { error, fallback }
    }

    /// A 400 for a malformed request body or query.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message.into() })),
        )
            .into_response()
    }
}

/// Status code for an error kind.
#[must_use]
pub fn status_for(error: &AppError) -> StatusCode {
    match error {
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        AppError::PathOutsideRoot(_) => StatusCode::FORBIDDEN,
        AppError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.error);
        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let mut response = (
                    status,
                    Json(json!({
                        "error": self.error.to_string(),
                        "retryAfter": RETRY_AFTER_SECONDS,
                    })),
                )
                    .into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(RETRY_AFTER_SECONDS),
                );
                response
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                error!(error = %self.error, "request failed");
                (status, Json(json!({ "error": self.fallback }))).into_response()
            }
            _ => (status, Json(json!({ "error": self.error.to_string() }))).into_response(),
        }
    }
}
