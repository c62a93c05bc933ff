//! Agent stdout reader task.
//!
//! Decodes newline-delimited JSON from the agent's stdout, classifies each
//! message, and routes it:
//!
//! | Kind | Routing |
//! |---|---|
//! | permission request | auto-replied with the `allow_once` option |
//! | `session/update` | [`AgentEvent::SessionUpdate`] |
//! | other notification | [`AgentEvent::Notification`] |
//! | other agent request | replied with `-32601` |
//! | response | delivered to the one pending waiter for its id |
//! | uncorrelated error | [`AgentEvent::ProtocolError`] |
//!
//! A line that is not valid JSON, or that exceeds the codec's length limit,
//! emits [`AgentEvent::ParseError`] and the loop carries on with the next
//! line.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::codec::{AcpCodec, DecodedLine};
use crate::acp::message::{
    self, InboundMessage, JsonRpcMessage, PermissionRequestParams, RequestId, RpcError,
    ERROR_METHOD_NOT_FOUND, METHOD_SESSION_UPDATE,
};
use crate::events::AgentEvent;

/// JSON-RPC "invalid params".
const ERROR_INVALID_PARAMS: i64 = -32602;

/// Result delivered to a request waiter.
pub type RpcOutcome = std::result::Result<Value, RpcError>;

/// Waiters for outstanding requests, keyed by request id.
///
/// A waiter is registered before its request is written, so a response can
/// never arrive ahead of its entry.
#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<u64, oneshot::Sender<RpcOutcome>>>,
}

impl PendingRequests {
    /// Register a waiter for `id`.
    pub fn register(&self, id: u64) -> oneshot::Receiver<RpcOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Drop the waiter for `id` without resolving it.
    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Deliver `outcome` to the waiter for `id`.
    ///
    /// Returns `false` when no waiter is registered.
    pub fn resolve(&self, id: u64, outcome: RpcOutcome) -> bool {
        match self.lock().remove(&id) {
            // A receiver dropped by a timed-out caller is not an error.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no request is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<RpcOutcome>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything the reader needs to route one session's inbound traffic.
#[derive(Clone)]
pub struct ReaderContext {
    /// Orchestrator session id stamped on every event.
    pub session_id: String,
    /// Outstanding request waiters.
    pub pending: Arc<PendingRequests>,
    /// Outbound frames (permission replies and method-not-found errors).
    pub outbound: mpsc::Sender<Value>,
    /// Coordinator event channel.
    pub events: mpsc::Sender<AgentEvent>,
}

/// Read and route agent stdout until EOF, an I/O failure, or cancellation.
///
/// On EOF or I/O failure every pending waiter is dropped and
/// [`AgentEvent::StreamClosed`] is emitted. Cancellation exits silently.
pub async fn run_reader<R>(ctx: ReaderContext, stdout: R, cancel: CancellationToken)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, AcpCodec::new());
    let session_id = ctx.session_id.clone();

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "acp reader: cancellation received, stopping");
                return;
            }

            next = framed.next() => match next {
                Some(Ok(DecodedLine::Line(line))) => ctx.handle_line(&line).await,
                Some(Ok(DecodedLine::TooLong)) => {
                    let error = DecodedLine::too_long_message();
                    warn!(session_id, error, "acp reader: oversized line skipped");
                    ctx.emit(AgentEvent::ParseError {
                        session_id: session_id.clone(),
                        line: String::new(),
                        error,
                    })
                    .await;
                }
                Some(Err(err)) => {
                    warn!(session_id, %err, "acp reader: stdout read failed");
                    break;
                }
                None => {
                    info!(session_id, "acp reader: stdout closed");
                    break;
                }
            }
        }
    }

    ctx.pending.clear();
    ctx.emit(AgentEvent::StreamClosed { session_id }).await;
}

impl ReaderContext {
    /// Parse, classify, and route one line.
    pub async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let envelope: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(session_id = self.session_id, %err, line, "acp reader: malformed json");
                self.emit(AgentEvent::ParseError {
                    session_id: self.session_id.clone(),
                    line: line.to_owned(),
                    error: err.to_string(),
                })
                .await;
                return;
            }
        };

        match InboundMessage::classify(envelope) {
            InboundMessage::PermissionRequest { id, params } => {
                self.answer_permission(&id, params).await;
            }
            InboundMessage::Notification { method, params } => {
                let event = if method == METHOD_SESSION_UPDATE {
                    AgentEvent::SessionUpdate {
                        session_id: self.session_id.clone(),
                        params,
                    }
                } else {
                    AgentEvent::Notification {
                        session_id: self.session_id.clone(),
                        method,
                        params,
                    }
                };
                self.emit(event).await;
            }
            InboundMessage::AgentRequest { id, method } => {
                debug!(session_id = self.session_id, %id, method, "acp reader: unsupported agent request");
                self.send(message::error_response(
                    &id,
                    ERROR_METHOD_NOT_FOUND,
                    &format!("method not found: {method}"),
                ))
                .await;
            }
            InboundMessage::Response { id, outcome } => {
                let delivered = id
                    .as_u64()
                    .is_some_and(|numeric| self.pending.resolve(numeric, outcome));
                if !delivered {
                    debug!(session_id = self.session_id, %id, "acp reader: response with no pending request");
                }
            }
            InboundMessage::Error(error) => {
                warn!(session_id = self.session_id, %error, "acp reader: agent reported error");
                self.emit(AgentEvent::ProtocolError {
                    session_id: self.session_id.clone(),
                    error,
                })
                .await;
            }
            InboundMessage::Unrecognized => {
                debug!(session_id = self.session_id, line, "acp reader: unrecognized message");
            }
        }
    }

    async fn answer_permission(&self, id: &RequestId, params: Value) {
        let params: PermissionRequestParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(err) => {
                warn!(session_id = self.session_id, %id, %err, "acp reader: malformed permission request");
                self.send(message::error_response(
                    id,
                    ERROR_INVALID_PARAMS,
                    &format!("invalid permission request: {err}"),
                ))
                .await;
                return;
            }
        };

        let Some(option) = params.allow_once() else {
            // Left unanswered: the agent's own timeout decides.
            warn!(
                session_id = self.session_id,
                %id,
                options = params.options.len(),
                "acp reader: no allow_once option offered, permission request left pending"
            );
            return;
        };

        info!(
            session_id = self.session_id,
            %id,
            option_id = option.option_id,
            "acp reader: auto-approving permission request"
        );
        self.send(message::response(
            id,
            serde_json::json!({ "optionId": option.option_id }),
        ))
        .await;
    }

    async fn send(&self, frame: Value) {
        if self.outbound.send(frame).await.is_err() {
            debug!(session_id = self.session_id, "acp reader: writer gone, reply dropped");
        }
    }

    async fn emit(&self, event: AgentEvent) {
        if self.events.send(event).await.is_err() {
            debug!(session_id = self.session_id, "acp reader: event consumer gone");
        }
    }
}
