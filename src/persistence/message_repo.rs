//! Message repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::message::Message;
use crate::{AppError, Result};

use super::db::Database;
use super::{format_timestamp, parse_timestamp};

/// Repository for conversation messages.
#[derive(Clone)]
pub struct MessageRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    timestamp: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: self.id,
            session_id: self.session_id,
            role: self.role.parse()?,
            content: self.content,
            timestamp: parse_timestamp("timestamp", &self.timestamp)?,
        })
    }
}

impl MessageRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a message record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert(&self, message: &Message) -> Result<Message> {
        sqlx::query(
            "INSERT INTO agent_message (id, session_id, role, content, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(format_timestamp(message.timestamp))
        .execute(self.db.as_ref())
        .await?;

        Ok(message.clone())
    }

    /// Messages for a session oldest first, optionally only those after `since`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_session(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        let since = since.map(format_timestamp);
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, role, content, timestamp
             FROM agent_message
             WHERE session_id = ?1 AND (?2 IS NULL OR timestamp > ?2)
             ORDER BY timestamp ASC, rowid ASC",
        )
        .bind(session_id)
        .bind(since)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Retrieve one message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if absent, or `AppError::Db` on failure.
    pub async fn get(&self, id: &str) -> Result<Message> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, session_id, role, content, timestamp FROM agent_message WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(MessageRow::into_message)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("message {id} not found")))
    }
}
