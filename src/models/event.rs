//! Fan-out channel wire events.
//!
//! Every frame on the realtime channel is a JSON object `{type, payload}`.
//! Server-originated frames are built through the constructors below so
//! payload field names stay in one place.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::message::{Message, MessageContent, MessageRole};
use crate::models::session::{Session, SessionStatus};

/// Event kinds carried on the fan-out channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    /// A session was created.
    #[serde(rename = "session.created")]
    SessionCreated,
    /// A session changed status.
    #[serde(rename = "session.status")]
    SessionStatus,
    /// A message was persisted.
    #[serde(rename = "message.new")]
    MessageNew,
    /// A streamed agent message grew or finished.
    #[serde(rename = "message.update")]
    MessageUpdate,
    /// A failure observers should surface.
    #[serde(rename = "error")]
    Error,
    /// Observer liveness probe.
    #[serde(rename = "ping")]
    Ping,
    /// Server liveness acknowledgment.
    #[serde(rename = "pong")]
    Pong,
}

/// One frame on the fan-out channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Kind-specific payload.
    #[serde(default)]
    pub payload: Value,
}

impl ServerEvent {
    /// `session.created` for a freshly persisted session.
    #[must_use]
    pub fn session_created(session: &Session) -> Self {
        Self {
            kind: EventKind::SessionCreated,
            payload: json!({
                "sessionId": session.id,
                "workspaceId": session.workspace_id,
                "status": session.status,
                "createdAt": timestamp(session.created_at),
            }),
        }
    }

    /// `session.status` after a transition.
    #[must_use]
    pub fn session_status(session_id: &str, status: SessionStatus) -> Self {
        Self {
            kind: EventKind::SessionStatus,
            payload: json!({ "sessionId": session_id, "status": status }),
        }
    }

    /// `message.new` for a persisted message.
    #[must_use]
    pub fn message_new(message: &Message) -> Self {
        Self {
            kind: EventKind::MessageNew,
            payload: json!({
                "sessionId": message.session_id,
                "messageId": message.id,
                "role": message.role,
                "content": message.parsed_content(),
                "timestamp": timestamp(message.timestamp),
            }),
        }
    }

    /// `message.update` for a streamed agent message.
    #[must_use]
    pub fn message_update(
        session_id: &str,
        message_id: &str,
        content: &MessageContent,
        complete: bool,
    ) -> Self {
        Self {
            kind: EventKind::MessageUpdate,
            payload: json!({
                "sessionId": session_id,
                "messageId": message_id,
                "role": MessageRole::Agent,
                "content": content,
                "complete": complete,
            }),
        }
    }

    /// `error` with a machine-readable code.
    #[must_use]
    pub fn error(code: &str, message: &str, details: Value) -> Self {
        Self {
            kind: EventKind::Error,
            payload: json!({ "code": code, "message": message, "details": details }),
        }
    }

    /// `pong` liveness acknowledgment.
    #[must_use]
    pub fn pong() -> Self {
        Self {
            kind: EventKind::Pong,
            payload: json!({ "timestamp": timestamp(Utc::now()) }),
        }
    }

    /// Compact JSON text for one WebSocket frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// RFC 3339 timestamp with millisecond precision, as sent on the wire.
#[must_use]
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
