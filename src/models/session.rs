//! Session model and lifecycle helpers.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppError;

/// Lifecycle status for an agent session.
///
/// `Active` is the only live state. `Completed`, `Cancelled`, and `Error`
/// are terminal. `Suspended` exists for records written by migrations and
/// is never entered by the coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session has a live agent process accepting prompts.
    Active,
    /// Agent process exited cleanly.
    Completed,
    /// Session cancelled by a caller, idle sweep, or shutdown.
    Cancelled,
    /// Reserved for a future resume feature.
    Suspended,
    /// Process or protocol failure.
    Error,
}

impl SessionStatus {
    /// Wire/storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Suspended => "suspended",
            Self::Error => "error",
        }
    }

    /// Whether no further coordinator-driven transition leaves this state.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

impl Display for SessionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "suspended" => Ok(Self::Suspended),
            "error" => Ok(Self::Error),
            other => Err(AppError::Db(format!("invalid session status: {other}"))),
        }
    }
}

/// One conversation with the external agent bound to one workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub id: String,
    /// Workspace the agent runs in.
    pub workspace_id: i64,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Session id assigned by the agent during the `session/new` handshake.
    pub agent_session_id: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last status or metadata change.
    pub updated_at: DateTime<Utc>,
    /// Last prompt or agent output.
    pub last_active_at: DateTime<Utc>,
}

impl Session {
    /// Construct a new active session with a generated identifier.
    #[must_use]
    pub fn new(workspace_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id,
            status: SessionStatus::Active,
            agent_session_id: None,
            created_at: now,
            updated_at: now,
            last_active_at: now,
        }
    }

    /// Whether the session still accepts prompts.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}
