//! Workspace metadata consumed by session creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A repository checkout sessions can run against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Workspace {
    /// Stable identifier.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Directory the agent process runs in.
    pub path: String,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
}
