//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so this is safe
//! to re-run on every server startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS workspace (
    id              INTEGER PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    path            TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_session (
    id              TEXT PRIMARY KEY NOT NULL,
    workspace_id    INTEGER NOT NULL,
    status          TEXT NOT NULL CHECK(status IN ('active','completed','cancelled','suspended','error')),
    agent_session_id TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    last_active_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_message (
    id              TEXT PRIMARY KEY NOT NULL,
    session_id      TEXT NOT NULL,
    role            TEXT NOT NULL CHECK(role IN ('user','agent','system')),
    content         TEXT NOT NULL,
    timestamp       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_workspace ON agent_session(workspace_id);
CREATE INDEX IF NOT EXISTS idx_session_status ON agent_session(status);
CREATE INDEX IF NOT EXISTS idx_message_session ON agent_message(session_id, timestamp);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
