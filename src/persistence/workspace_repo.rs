//! Workspace repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::Utc;

use crate::models::workspace::Workspace;
use crate::{AppError, Result};

use super::db::Database;
use super::{format_timestamp, parse_timestamp};

/// Repository for workspace metadata.
#[derive(Clone)]
pub struct WorkspaceRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: i64,
    name: String,
    path: String,
    created_at: String,
}

impl WorkspaceRow {
    fn into_workspace(self) -> Result<Workspace> {
        Ok(Workspace {
            id: self.id,
            name: self.name,
            path: self.path,
            created_at: parse_timestamp("created_at", &self.created_at)?,
        })
    }
}

impl WorkspaceRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or update a workspace by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the statement fails.
    pub async fn upsert(&self, id: i64, name: &str, path: &str) -> Result<Workspace> {
        sqlx::query(
            "INSERT INTO workspace (id, name, path, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, path = excluded.path",
        )
        .bind(id)
        .bind(name)
        .bind(path)
        .bind(format_timestamp(Utc::now()))
        .execute(self.db.as_ref())
        .await?;

        self.get(id).await
    }

    /// Retrieve a workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if absent, or `AppError::Db` on failure.
    pub async fn get(&self, id: i64) -> Result<Workspace> {
        let row: Option<WorkspaceRow> =
            sqlx::query_as("SELECT id, name, path, created_at FROM workspace WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(WorkspaceRow::into_workspace)
            .transpose()?
            .ok_or_else(|| AppError::NotFound(format!("workspace {id} not found")))
    }

    /// All workspaces ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<Workspace>> {
        let rows: Vec<WorkspaceRow> =
            sqlx::query_as("SELECT id, name, path, created_at FROM workspace ORDER BY id ASC")
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(WorkspaceRow::into_workspace).collect()
    }
}
