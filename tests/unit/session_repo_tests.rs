//! Unit tests for session persistence.

use std::sync::Arc;

use chrono::{Duration, Utc};

use acp_orchestrator::models::session::{Session, SessionStatus};
use acp_orchestrator::persistence::db;
use acp_orchestrator::persistence::session_repo::{SessionFilter, SessionRepo};
use acp_orchestrator::AppError;

async fn repo() -> SessionRepo {
    let pool = db::connect_memory().await.expect("in-memory db");
    SessionRepo::new(Arc::new(pool))
}

fn session_at(workspace_id: i64, minutes_ago: i64) -> Session {
    let mut session = Session::new(workspace_id);
    let at = Utc::now() - Duration::minutes(minutes_ago);
    session.created_at = at;
    session.updated_at = at;
    session.last_active_at = at;
    session
}

#[tokio::test]
async fn create_then_get_round_trips_fields() {
    let repo = repo().await;
    let session = Session::new(7);

    repo.create(&session).await.expect("create");
    let loaded = repo.get_by_id(&session.id).await.expect("get");

    assert_eq!(loaded.id, session.id);
    assert_eq!(loaded.workspace_id, 7);
    assert_eq!(loaded.status, SessionStatus::Active);
    assert!(loaded.agent_session_id.is_none());
}

#[tokio::test]
async fn missing_session_is_not_found() {
    let repo = repo().await;

    assert!(matches!(
        repo.get_by_id("nope").await,
        Err(AppError::NotFound(_))
    ));
    assert!(repo.find("nope").await.expect("find").is_none());
    assert!(matches!(
        repo.update_status("nope", SessionStatus::Cancelled).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_is_newest_first_with_total_and_filters() {
    let repo = repo().await;
    let oldest = session_at(1, 30);
    let middle = session_at(2, 20);
    let newest = session_at(1, 10);
    for s in [&oldest, &middle, &newest] {
        repo.create(s).await.expect("create");
    }
    repo.update_status(&middle.id, SessionStatus::Completed)
        .await
        .expect("status");

    let (all, total) = repo
        .list(&SessionFilter::default(), 20, 0)
        .await
        .expect("list");
    let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec![newest.id.as_str(), middle.id.as_str(), oldest.id.as_str()]);
    assert_eq!(total, 3);

    let (page, total) = repo
        .list(&SessionFilter::default(), 1, 1)
        .await
        .expect("page");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, middle.id);
    assert_eq!(total, 3, "total ignores pagination");

    let by_workspace = SessionFilter {
        workspace_id: Some(1),
        status: None,
    };
    let (ws, total) = repo.list(&by_workspace, 20, 0).await.expect("by workspace");
    assert_eq!(total, 2);
    assert!(ws.iter().all(|s| s.workspace_id == 1));

    let by_status = SessionFilter {
        workspace_id: None,
        status: Some(SessionStatus::Completed),
    };
    let (done, total) = repo.list(&by_status, 20, 0).await.expect("by status");
    assert_eq!(total, 1);
    assert_eq!(done[0].id, middle.id);
}

#[tokio::test]
async fn transition_if_active_leaves_terminal_status_alone() {
    let repo = repo().await;
    let session = Session::new(1);
    repo.create(&session).await.expect("create");

    assert!(repo
        .transition_if_active(&session.id, SessionStatus::Cancelled)
        .await
        .expect("first transition"));
    assert!(!repo
        .transition_if_active(&session.id, SessionStatus::Error)
        .await
        .expect("second transition"));

    let loaded = repo.get_by_id(&session.id).await.expect("get");
    assert_eq!(loaded.status, SessionStatus::Cancelled);
}

#[tokio::test]
async fn mark_all_active_returns_transitioned_ids() {
    let repo = repo().await;
    let live = Session::new(1);
    let done = Session::new(1);
    repo.create(&live).await.expect("create");
    repo.create(&done).await.expect("create");
    repo.update_status(&done.id, SessionStatus::Completed)
        .await
        .expect("status");

    let ids = repo
        .mark_all_active(SessionStatus::Cancelled)
        .await
        .expect("bulk");

    assert_eq!(ids, vec![live.id.clone()]);
    assert_eq!(
        repo.get_by_id(&done.id).await.expect("get").status,
        SessionStatus::Completed
    );
}

#[tokio::test]
async fn agent_session_id_and_touch_are_persisted() {
    let repo = repo().await;
    let session = session_at(1, 60);
    repo.create(&session).await.expect("create");

    repo.set_agent_session_id(&session.id, "abc")
        .await
        .expect("agent id");
    repo.touch(&session.id).await.expect("touch");

    let loaded = repo.get_by_id(&session.id).await.expect("get");
    assert_eq!(loaded.agent_session_id.as_deref(), Some("abc"));
    assert!(loaded.last_active_at > session.last_active_at);
}
