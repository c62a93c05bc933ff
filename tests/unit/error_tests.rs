//! Unit tests for error display and HTTP status mapping.

use axum::http::StatusCode;
use axum::response::IntoResponse;

use acp_orchestrator::http::error::{status_for, ApiError, RETRY_AFTER_SECONDS};
use acp_orchestrator::AppError;

#[test]
fn display_prefixes_kind() {
    assert_eq!(
        AppError::ResourceExhausted("maximum concurrent sessions (5) reached".into()).to_string(),
        "resource exhausted: maximum concurrent sessions (5) reached"
    );
    assert_eq!(AppError::NotFound("session x".into()).to_string(), "not found: session x");
    assert_eq!(
        AppError::NotInitialized("no handshake".into()).to_string(),
        "not initialized: no handshake"
    );
}

#[test]
fn toml_errors_become_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("= nope")
        .expect_err("invalid toml")
        .into();

    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn json_errors_become_parse_errors() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{")
        .expect_err("invalid json")
        .into();

    assert!(matches!(err, AppError::Parse(_)));
}

#[test]
fn io_errors_become_io_errors() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "agent stdin gone");

    let err = AppError::from(io);

    assert!(
        matches!(err, AppError::Io(ref msg) if msg.contains("agent stdin gone")),
        "unexpected error: {err}"
    );
}

#[test]
fn error_kinds_map_to_statuses() {
    let cases = [
        (AppError::NotFound(String::new()), StatusCode::NOT_FOUND),
        (AppError::ResourceExhausted(String::new()), StatusCode::TOO_MANY_REQUESTS),
        (AppError::PathOutsideRoot(String::new()), StatusCode::FORBIDDEN),
        (AppError::Conflict(String::new()), StatusCode::CONFLICT),
        (AppError::Timeout(String::new()), StatusCode::INTERNAL_SERVER_ERROR),
        (AppError::Spawn(String::new()), StatusCode::INTERNAL_SERVER_ERROR),
    ];

    for (err, expected) in cases {
        assert_eq!(status_for(&err), expected, "status for {err}");
    }
}

#[test]
fn ceiling_response_carries_retry_after() {
    let response = ApiError::new(
        AppError::ResourceExhausted("full".into()),
        "Failed to create session",
    )
    .into_response();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some(RETRY_AFTER_SECONDS.to_string().as_str())
    );
}
