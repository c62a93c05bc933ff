//! Conversation message model.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Author of a persisted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Prompt typed by the operator.
    User,
    /// Output streamed by the agent.
    Agent,
    /// Orchestrator-generated notice.
    System,
}

impl MessageRole {
    /// Wire/storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

impl Display for MessageRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(AppError::Db(format!("invalid message role: {other}"))),
        }
    }
}

/// Structured message body, stored as JSON text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text.
    Text {
        /// Message text.
        text: String,
    },
}

impl MessageContent {
    /// Build a text body.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The text carried by this body.
    #[must_use]
    pub fn as_text(&self) -> &str {
        match self {
            Self::Text { text } => text,
        }
    }

    /// Parse stored JSON, falling back to the raw string as text.
    #[must_use]
    pub fn from_stored(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_else(|_| Self::text(raw))
    }

    /// Serialize for storage.
    #[must_use]
    pub fn to_stored(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            // Serializing a tagged enum of strings cannot fail.
            Err(_) => String::new(),
        }
    }
}

/// A persisted conversation message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Message {
    /// Unique record identifier.
    pub id: String,
    /// Owning session.
    pub session_id: String,
    /// Author.
    pub role: MessageRole,
    /// Body as stored JSON text.
    pub content: String,
    /// Creation timestamp.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Construct a new message with a generated identifier.
    #[must_use]
    pub fn new(session_id: String, role: MessageRole, content: &MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            role,
            content: content.to_stored(),
            timestamp: Utc::now(),
        }
    }

    /// Parsed body with a text fallback for unrecognized shapes.
    #[must_use]
    pub fn parsed_content(&self) -> MessageContent {
        MessageContent::from_stored(&self.content)
    }
}
