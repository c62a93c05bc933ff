//! Session repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::session::{Session, SessionStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{format_timestamp, parse_timestamp};

/// Filter accepted by [`SessionRepo::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Restrict to one workspace.
    pub workspace_id: Option<i64>,
    /// Restrict to one status.
    pub status: Option<SessionStatus>,
}

/// Repository for session records.
#[derive(Clone)]
pub struct SessionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    workspace_id: i64,
    status: String,
    agent_session_id: Option<String>,
    created_at: String,
    updated_at: String,
    last_active_at: String,
}

impl SessionRow {
    fn into_session(self) -> Result<Session> {
        Ok(Session {
            id: self.id,
            workspace_id: self.workspace_id,
            status: self.status.parse()?,
            agent_session_id: self.agent_session_id,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            updated_at: parse_timestamp("updated_at", &self.updated_at)?,
            last_active_at: parse_timestamp("last_active_at", &self.last_active_at)?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, workspace_id, status, agent_session_id, created_at, updated_at, last_active_at
     FROM agent_session";

impl SessionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new session record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, session: &Session) -> Result<Session> {
        sqlx::query(
            "INSERT INTO agent_session
                 (id, workspace_id, status, agent_session_id, created_at, updated_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&session.id)
        .bind(session.workspace_id)
        .bind(session.status.as_str())
        .bind(&session.agent_session_id)
        .bind(format_timestamp(session.created_at))
        .bind(format_timestamp(session.updated_at))
        .bind(format_timestamp(session.last_active_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists, or `AppError::Db`
    /// if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Session> {
        self.find(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
    }

    /// Retrieve a session by identifier, `None` when absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find(&self, id: &str) -> Result<Option<Session>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(SessionRow::into_session).transpose()
    }

    /// List sessions newest first, with the total matching count.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if either query fails.
    pub async fn list(
        &self,
        filter: &SessionFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Session>, u64)> {
        let status = filter.status.map(SessionStatus::as_str);

        let rows: Vec<SessionRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS}
             WHERE (?1 IS NULL OR workspace_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC
             LIMIT ?3 OFFSET ?4"
        ))
        .bind(filter.workspace_id)
        .bind(status)
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(self.db.as_ref())
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agent_session
             WHERE (?1 IS NULL OR workspace_id = ?1) AND (?2 IS NULL OR status = ?2)",
        )
        .bind(filter.workspace_id)
        .bind(status)
        .fetch_one(self.db.as_ref())
        .await?;

        let sessions = rows
            .into_iter()
            .map(SessionRow::into_session)
            .collect::<Result<Vec<_>>>()?;
        Ok((sessions, u64::try_from(total).unwrap_or(0)))
    }

    /// Set a session's status regardless of its current value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn update_status(&self, id: &str, status: SessionStatus) -> Result<Session> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query("UPDATE agent_session SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(&now)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("session {id} not found")));
        }
        self.get_by_id(id).await
    }

    /// Move a session out of `active`, leaving any other status untouched.
    ///
    /// Returns `true` when the row was transitioned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn transition_if_active(&self, id: &str, status: SessionStatus) -> Result<bool> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE agent_session SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'active'",
        )
        .bind(status.as_str())
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the session id assigned by the agent handshake.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_agent_session_id(&self, id: &str, agent_session_id: &str) -> Result<()> {
        let now = format_timestamp(Utc::now());
        sqlx::query("UPDATE agent_session SET agent_session_id = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(agent_session_id)
            .bind(&now)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Bulk-transition every `active` session to `status`.
    ///
    /// Returns the identifiers that were transitioned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn mark_all_active(&self, status: SessionStatus) -> Result<Vec<String>> {
        let now = format_timestamp(Utc::now());
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE agent_session SET status = ?1, updated_at = ?2
             WHERE status = 'active'
             RETURNING id",
        )
        .bind(status.as_str())
        .bind(&now)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(ids)
    }

    /// Refresh `last_active_at` to now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn touch(&self, id: &str) -> Result<()> {
        let now = format_timestamp(Utc::now());
        sqlx::query("UPDATE agent_session SET last_active_at = ?1 WHERE id = ?2")
            .bind(&now)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }
}
