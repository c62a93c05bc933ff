//! Unit tests for the protocol client over in-memory pipes.
//!
//! The agent side of each pipe is driven by the test: it reads the
//! client's request lines and writes scripted replies.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use acp_orchestrator::acp::client::{AcpClient, ClientTimeouts};
use acp_orchestrator::acp::codec::MAX_LINE_BYTES;
use acp_orchestrator::acp::message::SessionUpdateParams;
use acp_orchestrator::events::AgentEvent;
use acp_orchestrator::AppError;

struct FakeAgent {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeAgent {
    async fn next_frame(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("frame within window")
            .expect("read line")
            .expect("stream open");
        serde_json::from_str(&line).expect("client writes JSON")
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.expect("write");
        self.writer.flush().await.expect("flush");
    }

    async fn send(&mut self, frame: &Value) {
        self.send_raw(&format!("{frame}\n")).await;
    }
}

fn connect(timeouts: ClientTimeouts) -> (std::sync::Arc<AcpClient>, FakeAgent, mpsc::Receiver<AgentEvent>) {
    let (client_io, agent_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (agent_read, agent_write) = tokio::io::split(agent_io);
    let (events_tx, events_rx) = mpsc::channel(32);

    let client = AcpClient::spawn("session-1", client_read, client_write, events_tx, timeouts);
    let agent = FakeAgent {
        lines: BufReader::new(agent_read).lines(),
        writer: agent_write,
    };
    (client, agent, events_rx)
}

async fn handshake(client: &AcpClient, agent: &mut FakeAgent) {
    let (created, ()) = tokio::join!(client.create_session("/work"), async {
        let frame = agent.next_frame().await;
        agent
            .send(&json!({ "jsonrpc": "2.0", "id": frame["id"], "result": { "sessionId": "abc" } }))
            .await;
    });
    assert_eq!(created.expect("handshake"), "abc");
}

// ── session/new ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_session_sends_cwd_and_stores_agent_id() {
    let (client, mut agent, _events) = connect(ClientTimeouts::default());

    let (created, frame) = tokio::join!(client.create_session("/work"), async {
        let frame = agent.next_frame().await;
        agent
            .send(&json!({ "jsonrpc": "2.0", "id": frame["id"], "result": { "sessionId": "abc" } }))
            .await;
        frame
    });

    assert_eq!(created.expect("session id"), "abc");
    assert_eq!(frame["method"], "session/new");
    assert_eq!(frame["id"], 1, "first request id is 1");
    assert_eq!(frame["params"]["cwd"], "/work");
    assert_eq!(frame["params"]["mcpServers"], json!([]));
    assert_eq!(client.agent_session_id().as_deref(), Some("abc"));
}

#[tokio::test]
async fn response_split_across_writes_is_reassembled() {
    let (client, mut agent, _events) = connect(ClientTimeouts::default());

    let (created, ()) = tokio::join!(client.create_session("/work"), async {
        let frame = agent.next_frame().await;
        let reply = format!(
            "{}\n",
            json!({ "jsonrpc": "2.0", "id": frame["id"], "result": { "sessionId": "abc" } })
        );
        let (head, tail) = reply.split_at(reply.len() / 2);
        agent.send_raw(head).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent.send_raw(tail).await;
    });

    assert_eq!(created.expect("session id"), "abc");
}

#[tokio::test]
async fn missing_session_id_is_protocol_error() {
    let (client, mut agent, _events) = connect(ClientTimeouts::default());

    let (created, ()) = tokio::join!(client.create_session("/work"), async {
        let frame = agent.next_frame().await;
        agent
            .send(&json!({ "jsonrpc": "2.0", "id": frame["id"], "result": {} }))
            .await;
    });

    assert!(matches!(created, Err(AppError::Protocol(_))));
}

#[tokio::test]
async fn rpc_error_reply_is_protocol_error() {
    let (client, mut agent, _events) = connect(ClientTimeouts::default());

    let (created, ()) = tokio::join!(client.create_session("/work"), async {
        let frame = agent.next_frame().await;
        agent
            .send(&json!({
                "jsonrpc": "2.0",
                "id": frame["id"],
                "error": { "code": -32000, "message": "auth required" }
            }))
            .await;
    });

    let err = created.expect_err("rpc error");
    assert!(
        matches!(err, AppError::Protocol(ref msg) if msg.contains("auth required")),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn silent_agent_times_out() {
    let timeouts = ClientTimeouts {
        session_new: Duration::from_millis(100),
        prompt: Duration::from_millis(100),
    };
    let (client, mut agent, _events) = connect(timeouts);

    let (created, _frame) = tokio::join!(client.create_session("/work"), agent.next_frame());

    assert!(matches!(created, Err(AppError::Timeout(_))));
    assert!(client.agent_session_id().is_none());
}

// ── session/prompt ────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_before_handshake_is_not_initialized() {
    let (client, _agent, _events) = connect(ClientTimeouts::default());

    let result = client.send_prompt("hi").await;

    assert!(matches!(result, Err(AppError::NotInitialized(_))));
}

#[tokio::test]
async fn prompt_streams_updates_before_result() {
    let (client, mut agent, mut events) = connect(ClientTimeouts::default());
    handshake(&client, &mut agent).await;

    let (result, frame) = tokio::join!(client.send_prompt("say hello"), async {
        let frame = agent.next_frame().await;
        agent
            .send(&json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": "abc",
                    "update": {
                        "sessionUpdate": "agent_message_chunk",
                        "content": { "type": "text", "text": "hello" }
                    }
                }
            }))
            .await;
        agent
            .send(&json!({ "jsonrpc": "2.0", "id": frame["id"], "result": { "stopReason": "end_turn" } }))
            .await;
        frame
    });

    assert_eq!(result.expect("turn")["stopReason"], "end_turn");
    assert_eq!(frame["id"], 2);
    assert_eq!(frame["params"]["sessionId"], "abc");
    assert_eq!(frame["params"]["prompt"][0]["text"], "say hello");

    let event = events.recv().await.expect("update event");
    match event {
        AgentEvent::SessionUpdate { session_id, params } => {
            assert_eq!(session_id, "session-1");
            let update: SessionUpdateParams =
                serde_json::from_value(params).expect("update params");
            assert_eq!(update.content_text().as_deref(), Some("hello"));
        }
        other => panic!("expected session update, got {other:?}"),
    }
}

// ── Agent-initiated requests ──────────────────────────────────────────────────

#[tokio::test]
async fn permission_request_is_answered_with_allow_once_option() {
    let (_client, mut agent, _events) = connect(ClientTimeouts::default());

    agent
        .send(&json!({
            "jsonrpc": "2.0",
            "id": 41,
            "method": "session/request_permission",
            "params": {
                "sessionId": "abc",
                "options": [
                    { "optionId": "reject", "name": "Reject", "kind": "reject_once" },
                    { "optionId": "x", "name": "Allow", "kind": "allow_once" }
                ],
                "toolCall": { "title": "write file" }
            }
        }))
        .await;

    let reply = agent.next_frame().await;
    assert_eq!(
        reply,
        json!({ "jsonrpc": "2.0", "id": 41, "result": { "optionId": "x" } })
    );
}

#[tokio::test]
async fn unknown_agent_request_gets_method_not_found() {
    let (_client, mut agent, _events) = connect(ClientTimeouts::default());

    agent
        .send(&json!({ "jsonrpc": "2.0", "id": 9, "method": "fs/read_text_file", "params": {} }))
        .await;

    let reply = agent.next_frame().await;
    assert_eq!(reply["id"], 9);
    assert_eq!(reply["error"]["code"], -32601);
}

// ── Stream robustness ─────────────────────────────────────────────────────────

#[tokio::test]
async fn garbage_line_does_not_poison_stream() {
    let (client, mut agent, mut events) = connect(ClientTimeouts::default());

    agent.send_raw("this is not json\n").await;

    let event = events.recv().await.expect("parse event");
    assert!(
        matches!(event, AgentEvent::ParseError { ref line, .. } if line == "this is not json"),
        "unexpected event: {event:?}"
    );

    handshake(&client, &mut agent).await;
}

#[tokio::test]
async fn oversized_line_is_skipped_and_stream_continues() {
    let (client, mut agent, mut events) = connect(ClientTimeouts::default());

    let (created, ()) = tokio::join!(client.create_session("/work"), async {
        let frame = agent.next_frame().await;
        let huge = format!(
            "{{\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{{\"pad\":\"{}\"}}}}\n",
            "x".repeat(MAX_LINE_BYTES + 64)
        );
        agent.send_raw(&huge).await;
        agent
            .send(&json!({ "jsonrpc": "2.0", "id": frame["id"], "result": { "sessionId": "abc" } }))
            .await;
    });

    assert_eq!(created.expect("handshake after oversized line"), "abc");
    let event = events.recv().await.expect("parse event");
    assert!(
        matches!(event, AgentEvent::ParseError { ref error, .. } if error.contains("line too long")),
        "unexpected event: {event:?}"
    );
    assert!(events.try_recv().is_err(), "stream stays open");
}

#[tokio::test]
async fn agent_eof_fails_pending_request_and_reports_closed() {
    let (client, agent, mut events) = connect(ClientTimeouts::default());
    let FakeAgent { mut lines, writer } = agent;

    let (created, ()) = tokio::join!(client.create_session("/work"), async move {
        let _request = lines.next_line().await.expect("read");
        drop(lines);
        drop(writer);
    });

    assert!(matches!(created, Err(AppError::Protocol(ref msg)) if msg.contains("closed")));
    let event = events.recv().await.expect("closed event");
    assert!(matches!(event, AgentEvent::StreamClosed { .. }));
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_writes() {
    let (client, mut agent, _events) = connect(ClientTimeouts::default());
    handshake(&client, &mut agent).await;

    client.close();
    client.close();

    assert!(client.is_closed());
    assert!(matches!(
        client.cancel_session(None).await,
        Err(AppError::Protocol(_))
    ));
}

#[tokio::test]
async fn queued_cancel_reaches_agent_before_stdin_closes() {
    let (client, mut agent, _events) = connect(ClientTimeouts::default());
    handshake(&client, &mut agent).await;

    client.cancel_session(Some("bye")).await.expect("queue cancel");
    client.close();

    let frame = agent.next_frame().await;
    assert_eq!(frame["method"], "session/cancel");
    assert_eq!(frame["params"]["sessionId"], "abc");
    let eof = tokio::time::timeout(Duration::from_secs(2), agent.lines.next_line())
        .await
        .expect("stdin closed within window")
        .expect("read");
    assert!(eof.is_none(), "stdin is closed after the queue drains");
}

#[tokio::test]
async fn close_and_flush_waits_for_queued_frames() {
    let (client, mut agent, _events) = connect(ClientTimeouts::default());
    handshake(&client, &mut agent).await;

    client.cancel_session(None).await.expect("queue cancel");
    client.close_and_flush().await;

    assert!(client.is_closed());
    assert_eq!(agent.next_frame().await["method"], "session/cancel");
}

#[tokio::test]
async fn cancel_before_handshake_is_noop() {
    let (client, _agent, _events) = connect(ClientTimeouts::default());

    client.cancel_session(Some("user")).await.expect("noop cancel");
}
