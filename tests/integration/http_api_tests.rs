//! HTTP API tests over a real listener.

use std::net::SocketAddr;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use acp_orchestrator::http::{self, AppState};

use super::test_helpers::{Harness, ECHO_AGENT, OUTSIDE_WORKSPACE_ID, WORKSPACE_ID};

async fn serve(harness: &Harness) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = AppState {
        coordinator: harness.coordinator.clone(),
    };
    let ct = harness.ct.clone();
    tokio::spawn(async move {
        let _ = http::serve(listener, state, ct).await;
    });
    addr
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

// ── Health and workspaces ─────────────────────────────────────────────────────

#[tokio::test]
async fn health_returns_ok() {
    let harness = Harness::start(ECHO_AGENT).await;
    let addr = serve(&harness).await;

    let resp = reqwest::get(url(addr, "/health")).await.expect("request");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok");
    harness.shutdown().await;
}

#[tokio::test]
async fn workspaces_are_listed() {
    let harness = Harness::start(ECHO_AGENT).await;
    let addr = serve(&harness).await;

    let body: Value = reqwest::get(url(addr, "/api/workspaces"))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");

    let ids: Vec<i64> = body
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|w| w["id"].as_i64())
        .collect();
    assert_eq!(ids, vec![WORKSPACE_ID, OUTSIDE_WORKSPACE_ID]);
    harness.shutdown().await;
}

// ── Sessions ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn session_round_trip_over_http() {
    let harness = Harness::start(ECHO_AGENT).await;
    let addr = serve(&harness).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(url(addr, "/api/sessions"))
        .json(&json!({ "repoId": WORKSPACE_ID }))
        .send()
        .await
        .expect("create");
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.expect("json");
    let id = created["id"].as_str().expect("id").to_owned();
    assert_eq!(created["repoId"], WORKSPACE_ID);
    assert_eq!(created["status"], "active");
    assert_eq!(created["agentSessionId"], "fake-agent-session");

    let resp = client
        .post(url(addr, &format!("/api/sessions/{id}/prompt")))
        .json(&json!({ "text": "say hello" }))
        .send()
        .await
        .expect("prompt");
    assert_eq!(resp.status(), 200);
    let accepted: Value = resp.json().await.expect("json");
    assert_eq!(accepted["accepted"], true);
    assert_eq!(accepted["stopReason"], "end_turn");
    assert!(accepted["messageId"].is_string());

    let detail: Value = client
        .get(url(addr, &format!("/api/sessions/{id}")))
        .send()
        .await
        .expect("detail")
        .json()
        .await
        .expect("json");
    assert_eq!(detail["id"], id.as_str());
    assert_eq!(detail["messages"][0]["role"], "user");
    assert_eq!(detail["messages"][0]["content"]["text"], "say hello");

    let listed: Value = client
        .get(url(addr, "/api/sessions?status=active&limit=5"))
        .send()
        .await
        .expect("list")
        .json()
        .await
        .expect("json");
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["limit"], 5);
    assert_eq!(listed["offset"], 0);
    assert_eq!(listed["sessions"][0]["id"], id.as_str());

    let resp = client
        .delete(url(addr, &format!("/api/sessions/{id}")))
        .send()
        .await
        .expect("cancel");
    assert_eq!(resp.status(), 200);
    let cancelled: Value = resp.json().await.expect("json");
    assert_eq!(cancelled["success"], true);
    assert_eq!(cancelled["session"]["status"], "cancelled");

    let resp = client
        .post(url(addr, &format!("/api/sessions/{id}/prompt")))
        .json(&json!({ "text": "again" }))
        .send()
        .await
        .expect("prompt after cancel");
    assert_eq!(resp.status(), 409);

    harness.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let harness = Harness::start(ECHO_AGENT).await;
    let addr = serve(&harness).await;
    let client = reqwest::Client::new();

    let missing_repo = client
        .post(url(addr, "/api/sessions"))
        .json(&json!({}))
        .send()
        .await
        .expect("create");
    assert_eq!(missing_repo.status(), 400);

    let empty_body = client
        .post(url(addr, "/api/sessions"))
        .send()
        .await
        .expect("create");
    assert_eq!(empty_body.status(), 400);

    let unknown_repo = client
        .post(url(addr, "/api/sessions"))
        .json(&json!({ "repoId": 404 }))
        .send()
        .await
        .expect("create");
    assert_eq!(unknown_repo.status(), 404);

    let outside = client
        .post(url(addr, "/api/sessions"))
        .json(&json!({ "repoId": OUTSIDE_WORKSPACE_ID }))
        .send()
        .await
        .expect("create");
    assert_eq!(outside.status(), 403);

    let bad_status = client
        .get(url(addr, "/api/sessions?status=sleeping"))
        .send()
        .await
        .expect("list");
    assert_eq!(bad_status.status(), 400);

    let blank_prompt = client
        .post(url(addr, "/api/sessions/whatever/prompt"))
        .json(&json!({ "text": "  " }))
        .send()
        .await
        .expect("prompt");
    assert_eq!(blank_prompt.status(), 400);

    let unknown_session = client
        .get(url(addr, "/api/sessions/missing/messages"))
        .send()
        .await
        .expect("messages");
    assert_eq!(unknown_session.status(), 404);

    let bad_since = client
        .get(url(addr, "/api/sessions/missing/messages?since=yesterday"))
        .send()
        .await
        .expect("messages");
    assert_eq!(bad_since.status(), 400);

    harness.shutdown().await;
}

#[tokio::test]
async fn ceiling_returns_429_with_retry_after() {
    let harness = Harness::start_with(ECHO_AGENT, |config| {
        config.max_concurrent_sessions = 1;
    })
    .await;
    let addr = serve(&harness).await;
    let client = reqwest::Client::new();

    let first = client
        .post(url(addr, "/api/sessions"))
        .json(&json!({ "repoId": WORKSPACE_ID }))
        .send()
        .await
        .expect("first");
    assert_eq!(first.status(), 201);

    let second = client
        .post(url(addr, "/api/sessions"))
        .json(&json!({ "repoId": WORKSPACE_ID }))
        .send()
        .await
        .expect("second");
    assert_eq!(second.status(), 429);
    assert_eq!(
        second
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok()),
        Some("60")
    );
    let body: Value = second.json().await.expect("json");
    assert_eq!(body["retryAfter"], 60);

    harness.shutdown().await;
}
