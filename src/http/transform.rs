//! Total mappings from stored records to API response bodies.
//!
//! Every field has a defined value: unparseable message content becomes a
//! text block carrying the raw stored string.

use serde::Serialize;

use crate::models::event::timestamp;
use crate::models::message::{Message, MessageContent, MessageRole};
use crate::models::session::{Session, SessionStatus};
use crate::models::workspace::Workspace;
use crate::orchestrator::coordinator::SessionDetail;

/// Session as returned by the API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    /// Session identifier.
    pub id: String,
    /// Workspace identifier.
    pub repo_id: i64,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Agent-assigned session id, `null` before the handshake.
    pub agent_session_id: Option<String>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 last status change.
    pub updated_at: String,
    /// RFC 3339 last activity.
    pub last_active_at: String,
}

/// Message as returned by the API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    /// Message identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Author.
    pub role: MessageRole,
    /// Parsed body.
    pub content: MessageContent,
    /// RFC 3339 creation time.
    pub timestamp: String,
}

/// Session together with its conversation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetailResponse {
    /// Session fields.
    #[serde(flatten)]
    pub session: SessionResponse,
    /// Messages oldest first.
    pub messages: Vec<MessageResponse>,
}

/// Workspace as returned by the API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceResponse {
    /// Workspace identifier.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Checkout directory.
    pub path: String,
    /// RFC 3339 registration time.
    pub created_at: String,
}

/// Map a stored session.
#[must_use]
pub fn session_response(session: &Session) -> SessionResponse {
    SessionResponse {
        id: session.id.clone(),
        repo_id: session.workspace_id,
        status: session.status,
        agent_session_id: session.agent_session_id.clone(),
        created_at: timestamp(session.created_at),
        updated_at: timestamp(session.updated_at),
        last_active_at: timestamp(session.last_active_at),
    }
}

/// Map a stored message, falling back to a text block for bad content.
#[must_use]
pub fn message_response(message: &Message) -> MessageResponse {
    MessageResponse {
        id: message.id.clone(),
        session_id: message.session_id.clone(),
        role: message.role,
        content: message.parsed_content(),
        timestamp: timestamp(message.timestamp),
    }
}

/// Map a session with its messages.
#[must_use]
pub fn session_detail_response(detail: &SessionDetail) -> SessionDetailResponse {
    SessionDetailResponse {
        session: session_response(&detail.session),
        messages: detail.messages.iter().map(message_response).collect(),
    }
}

/// Map a stored workspace.
#[must_use]
pub fn workspace_response(workspace: &Workspace) -> WorkspaceResponse {
    WorkspaceResponse {
        id: workspace.id,
        name: workspace.name.clone(),
        path: workspace.path.clone(),
        created_at: timestamp(workspace.created_at),
    }
}
