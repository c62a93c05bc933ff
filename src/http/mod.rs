//! HTTP surface: sessions API, workspace listing, health, and the `/ws`
//! fan-out channel.

pub mod error;
pub mod transform;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::session::SessionStatus;
use crate::orchestrator::coordinator::SessionCoordinator;
use crate::persistence::session_repo::SessionFilter;
use crate::realtime::serve_socket;
use crate::{AppError, Result};

use self::error::ApiError;
use self::transform::{
    message_response, session_detail_response, session_response, workspace_response,
};

/// Default page size for session listings.
const DEFAULT_LIMIT: u32 = 20;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Session coordinator.
    pub coordinator: Arc<SessionCoordinator>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_upgrade))
        .route("/api/workspaces", get(list_workspaces))
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{id}", get(get_session).delete(cancel_session))
        .route("/api/sessions/{id}/prompt", post(send_prompt))
        .route("/api/sessions/{id}/messages", get(get_messages))
        .with_state(state)
}

/// Serve the router on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails.
pub async fn serve(listener: TcpListener, state: AppState, ct: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Io(format!("listener address unavailable: {err}")))?;
    info!(%addr, "http server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("http server shut down");
    Ok(())
}

// ── Request bodies ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    repo_id: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SendPromptBody {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListSessionsQuery {
    repo_id: Option<i64>,
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesQuery {
    since: Option<String>,
}

/// Parse a JSON body, treating an empty body as all fields absent.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> std::result::Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::bad_request(format!("invalid JSON body: {err}")))
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.coordinator.hub();
    ws.on_upgrade(move |socket| serve_socket(hub, socket))
}

async fn list_workspaces(State(state): State<AppState>) -> Response {
    match state.coordinator.list_workspaces().await {
        Ok(workspaces) => {
            Json(workspaces.iter().map(workspace_response).collect::<Vec<_>>()).into_response()
        }
        Err(err) => ApiError::new(err, "Failed to list workspaces").into_response(),
    }
}

async fn create_session(State(state): State<AppState>, body: Bytes) -> Response {
    let body: CreateSessionBody = match parse_body(&body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Some(repo_id) = body.repo_id else {
        return ApiError::bad_request("repoId is required");
    };

    match state.coordinator.create_session(repo_id).await {
        Ok(session) => (StatusCode::CREATED, Json(session_response(&session))).into_response(),
        Err(err) => ApiError::new(err, "Failed to create session").into_response(),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<SessionStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(_)) => return ApiError::bad_request("unknown status filter"),
    };
    let filter = SessionFilter {
        workspace_id: query.repo_id,
        status,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = query.offset.unwrap_or(0);

    match state.coordinator.list_sessions(&filter, limit, offset).await {
        Ok((sessions, total)) => Json(json!({
            "sessions": sessions.iter().map(session_response).collect::<Vec<_>>(),
            "total": total,
            "limit": limit,
            "offset": offset,
        }))
        .into_response(),
        Err(err) => ApiError::new(err, "Failed to list sessions").into_response(),
    }
}

async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.coordinator.get_session(&id).await {
        Ok(detail) => Json(session_detail_response(&detail)).into_response(),
        Err(err) => ApiError::new(err, "Failed to get session").into_response(),
    }
}

async fn send_prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let body: SendPromptBody = match parse_body(&body) {
        Ok(body) => body,
        Err(response) => return response,
    };
    let Some(text) = body.text.filter(|text| !text.trim().is_empty()) else {
        return ApiError::bad_request("text is required");
    };

    match state.coordinator.send_prompt(&id, &text).await {
        Ok(receipt) => Json(json!({
            "accepted": true,
            "messageId": receipt.message_id,
            "stopReason": receipt.stop_reason,
        }))
        .into_response(),
        Err(err) => ApiError::new(err, "Failed to send prompt").into_response(),
    }
}

async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Response {
    let since = match query.since.as_deref().map(DateTime::parse_from_rfc3339) {
        None => None,
        Some(Ok(since)) => Some(since.with_timezone(&Utc)),
        Some(Err(_)) => return ApiError::bad_request("since must be an RFC 3339 timestamp"),
    };

    match state.coordinator.get_messages(&id, since).await {
        Ok(messages) => {
            Json(messages.iter().map(message_response).collect::<Vec<_>>()).into_response()
        }
        Err(err) => ApiError::new(err, "Failed to get messages").into_response(),
    }
}

async fn cancel_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.coordinator.cancel_session(&id).await {
        Ok(session) => Json(json!({
            "success": true,
            "session": session_response(&session),
        }))
        .into_response(),
        Err(err) => ApiError::new(err, "Failed to cancel session").into_response(),
    }
}
