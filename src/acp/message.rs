//! JSON-RPC envelope and the ACP method vocabulary.
//!
//! Inbound lines are parsed into the loose [`JsonRpcMessage`] envelope and
//! then classified by [`InboundMessage::classify`]. Outbound frames are
//! built by the constructors at the bottom of this module.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ── Method names ──────────────────────────────────────────────────────────────

/// Handshake request creating an agent-side session.
pub const METHOD_SESSION_NEW: &str = "session/new";
/// Prompt turn request.
pub const METHOD_SESSION_PROMPT: &str = "session/prompt";
/// Turn cancellation, sent without awaiting a response.
pub const METHOD_SESSION_CANCEL: &str = "session/cancel";
/// Agent → client streaming notification.
pub const METHOD_SESSION_UPDATE: &str = "session/update";
/// Agent → client permission prompt.
pub const METHOD_REQUEST_PERMISSION: &str = "session/request_permission";

/// Update kind persisted as agent output.
pub const UPDATE_AGENT_MESSAGE_CHUNK: &str = "agent_message_chunk";
/// Permission option kind chosen by the auto-approver.
pub const PERMISSION_ALLOW_ONCE: &str = "allow_once";

/// JSON-RPC "method not found".
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;

// ── Envelope ──────────────────────────────────────────────────────────────────

/// JSON-RPC request identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id; every id this crate assigns is numeric.
    Number(u64),
    /// String id, as some agents use for their own requests.
    Text(String),
}

impl RequestId {
    /// The numeric value, if any.
    #[must_use]
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.parse().ok(),
        }
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Display for RpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// Any JSON-RPC object; which fields are present decides its kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcMessage {
    /// Protocol version tag, `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Correlation id; absent on notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name on requests and notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Success payload on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload on responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

// ── ACP params ────────────────────────────────────────────────────────────────

/// One choice offered by a permission prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    /// Identifier echoed back in the reply.
    pub option_id: String,
    /// Display label.
    #[serde(default)]
    pub name: String,
    /// Option kind, e.g. `allow_once` or `reject_once`.
    pub kind: String,
}

/// Params of `session/request_permission`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestParams {
    /// Agent-side session id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Offered choices.
    #[serde(default)]
    pub options: Vec<PermissionOption>,
    /// Tool call awaiting permission.
    #[serde(default)]
    pub tool_call: Option<Value>,
}

impl PermissionRequestParams {
    /// The first option of kind `allow_once`.
    #[must_use]
    pub fn allow_once(&self) -> Option<&PermissionOption> {
        self.options.iter().find(|o| o.kind == PERMISSION_ALLOW_ONCE)
    }
}

/// Params of `session/update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionUpdateParams {
    /// Agent-side session id.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Update body; `sessionUpdate` names its kind.
    #[serde(default)]
    pub update: Value,
}

impl SessionUpdateParams {
    /// Update kind (`agent_message_chunk`, `agent_thought_chunk`, `plan`, ...).
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.update.get("sessionUpdate").and_then(Value::as_str)
    }

    /// Text carried by the update's content block.
    ///
    /// Returns the `text` of a `{type:"text"}` block (or of each such block
    /// when `content` is an array, concatenated). Any other shape returns
    /// its compact JSON so no output is silently dropped.
    #[must_use]
    pub fn content_text(&self) -> Option<String> {
        let content = self.update.get("content")?;
        match content {
            Value::String(s) => Some(s.clone()),
            Value::Array(blocks) => {
                let texts: Vec<&str> = blocks.iter().filter_map(text_of).collect();
                if texts.is_empty() {
                    Some(content.to_string())
                } else {
                    Some(texts.concat())
                }
            }
            other => Some(text_of(other).map_or_else(|| other.to_string(), str::to_owned)),
        }
    }
}

fn text_of(block: &Value) -> Option<&str> {
    if block.get("type").and_then(Value::as_str) == Some("text") {
        block.get("text").and_then(Value::as_str)
    } else {
        None
    }
}

// ── Classification ────────────────────────────────────────────────────────────

/// An inbound message sorted by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Agent asks for permission; must be answered under `id`.
    PermissionRequest {
        /// Request id to reply under.
        id: RequestId,
        /// Raw params.
        params: Value,
    },
    /// Method without id.
    Notification {
        /// Method name.
        method: String,
        /// Raw params, `Value::Null` when absent.
        params: Value,
    },
    /// Agent-initiated request for a method this client does not serve.
    AgentRequest {
        /// Request id to reply under.
        id: RequestId,
        /// Method name.
        method: String,
    },
    /// Reply to one of our requests.
    Response {
        /// Id of the request being answered.
        id: RequestId,
        /// Success payload or error.
        outcome: std::result::Result<Value, RpcError>,
    },
    /// Error object with no id to correlate.
    Error(RpcError),
    /// Nothing recognizable.
    Unrecognized,
}

impl InboundMessage {
    /// Classify an envelope.
    ///
    /// Precedence: permission request (id + permission method), notification
    /// (method, no id), agent request (id + other method), response (id),
    /// uncorrelated error, unrecognized.
    #[must_use]
    pub fn classify(msg: JsonRpcMessage) -> Self {
        match (msg.id, msg.method) {
            (Some(id), Some(method)) if method == METHOD_REQUEST_PERMISSION => {
                Self::PermissionRequest {
                    id,
                    params: msg.params.unwrap_or(Value::Null),
                }
            }
            (None, Some(method)) => Self::Notification {
                method,
                params: msg.params.unwrap_or(Value::Null),
            },
            (Some(id), Some(method)) => Self::AgentRequest { id, method },
            (Some(id), None) => {
                let outcome = match msg.error {
                    Some(err) => Err(err),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                Self::Response { id, outcome }
            }
            (None, None) => msg.error.map_or(Self::Unrecognized, Self::Error),
        }
    }
}

// ── Outbound frames ───────────────────────────────────────────────────────────

/// A request frame.
#[must_use]
pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// A success response frame.
#[must_use]
pub fn response(id: &RequestId, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// An error response frame.
#[must_use]
pub fn error_response(id: &RequestId, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

/// `session/new` params for a workspace directory.
#[must_use]
pub fn session_new_params(cwd: &str) -> Value {
    json!({ "cwd": cwd, "mcpServers": [] })
}

/// `session/prompt` params carrying one text block.
#[must_use]
pub fn session_prompt_params(session_id: &str, text: &str) -> Value {
    json!({ "sessionId": session_id, "prompt": [{ "type": "text", "text": text }] })
}

/// `session/cancel` params.
#[must_use]
pub fn session_cancel_params(session_id: &str, reason: Option<&str>) -> Value {
    match reason {
        Some(reason) => json!({ "sessionId": session_id, "reason": reason }),
        None => json!({ "sessionId": session_id }),
    }
}
