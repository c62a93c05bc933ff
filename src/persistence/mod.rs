//! Persistence layer modules.

pub mod db;
pub mod message_repo;
pub mod schema;
pub mod session_repo;
pub mod workspace_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

/// Parse an RFC 3339 column into a UTC timestamp.
pub(crate) fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {column}: {e}")))
}

/// Render a timestamp in the fixed-width form stored in every table.
///
/// Fixed microsecond precision with a `Z` suffix keeps lexical and
/// chronological order identical.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
