//! Fan-out channel tests over a real WebSocket.

use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use acp_orchestrator::http::{self, AppState};
use acp_orchestrator::models::event::ServerEvent;
use acp_orchestrator::models::session::SessionStatus;

use super::test_helpers::{wait_until, Harness, ECHO_AGENT};

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(harness: &Harness) -> Socket {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = AppState {
        coordinator: harness.coordinator.clone(),
    };
    let ct = harness.ct.clone();
    tokio::spawn(async move {
        let _ = http::serve(listener, state, ct).await;
    });

    let (socket, _response) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect");
    socket
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("frame within window")
            .expect("socket open")
            .expect("frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("frame is JSON");
        }
    }
}

#[tokio::test]
async fn observer_gets_pong_on_connect_and_on_ping() {
    let harness = Harness::start(ECHO_AGENT).await;
    let mut socket = connect(&harness).await;

    let hello = next_frame(&mut socket).await;
    assert_eq!(hello["type"], "pong");
    assert!(hello["payload"]["timestamp"].is_string());

    socket
        .send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .expect("send ping");
    let reply = next_frame(&mut socket).await;
    assert_eq!(reply["type"], "pong");

    harness.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_connected_observer() {
    let harness = Harness::start(ECHO_AGENT).await;
    let mut socket = connect(&harness).await;
    let _hello = next_frame(&mut socket).await;
    let hub = harness.hub.clone();
    assert!(wait_until(move || {
        let connected = hub.client_count() == 1;
        async move { connected }
    })
    .await);

    harness
        .hub
        .broadcast(&ServerEvent::session_status("s1", SessionStatus::Completed));

    let frame = next_frame(&mut socket).await;
    assert_eq!(frame["type"], "session.status");
    assert_eq!(frame["payload"]["sessionId"], "s1");
    assert_eq!(frame["payload"]["status"], "completed");

    harness.shutdown().await;
}

#[tokio::test]
async fn hub_shutdown_closes_observer() {
    let harness = Harness::start(ECHO_AGENT).await;
    let mut socket = connect(&harness).await;
    let _hello = next_frame(&mut socket).await;

    harness.hub.shutdown();

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match socket.next().await {
                None | Some(Ok(Message::Close(_)) | Err(_)) => return true,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("close within window");
    assert!(closed);
    harness.shutdown().await;
}

#[tokio::test]
async fn swept_observer_connection_is_dropped() {
    let harness = Harness::start(ECHO_AGENT).await;
    let mut socket = connect(&harness).await;
    let _hello = next_frame(&mut socket).await;
    let hub = harness.hub.clone();
    assert!(wait_until(move || {
        let connected = hub.client_count() == 1;
        async move { connected }
    })
    .await);

    let swept = harness
        .hub
        .sweep_stale_at(Utc::now() + chrono::Duration::seconds(600));
    assert_eq!(swept.len(), 1);

    // Read the raw transport so no close reply is sent from this side: a
    // silent peer must still see the server close the connection.
    let raw = socket.get_mut();
    let mut buf = [0_u8; 256];
    let ended = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match raw.read(&mut buf).await {
                Ok(0) | Err(_) => return true,
                Ok(_) => {}
            }
        }
    })
    .await
    .expect("server drops the connection within window");
    assert!(ended);
    harness.shutdown().await;
}
