//! Session coordinator.
//!
//! Ties the process supervisor, protocol clients, streaming tracker,
//! persistence, and fan-out hub together. The coordinator is the single
//! consumer of [`AgentEvent`]s and the only component that changes a
//! session's persisted status.
//!
//! Status machine: `active → {completed, cancelled, error}`. Every
//! coordinator-driven transition broadcasts `session.status`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::acp::client::{AcpClient, ClientTimeouts};
use crate::acp::message::{SessionUpdateParams, UPDATE_AGENT_MESSAGE_CHUNK};
use crate::config::GlobalConfig;
use crate::events::{AgentEvent, TurnOutcome};
use crate::models::event::ServerEvent;
use crate::models::message::{Message, MessageContent, MessageRole};
use crate::models::session::{Session, SessionStatus};
use crate::models::workspace::Workspace;
use crate::orchestrator::path_guard::resolve_workspace_path;
use crate::orchestrator::streaming::{lock_tracker, SharedStreamTracker, StreamTracker};
use crate::orchestrator::supervisor::{ProcessSupervisor, SlotReservation, SupervisorConfig};
use crate::persistence::db::Database;
use crate::persistence::message_repo::MessageRepo;
use crate::persistence::session_repo::{SessionFilter, SessionRepo};
use crate::persistence::workspace_repo::WorkspaceRepo;
use crate::realtime::RealtimeHub;
use crate::{AppError, Result};

/// Capacity of the coordinator's event queue.
const EVENT_CAPACITY: usize = 256;

/// Error code broadcast when a prompt turn fails mid-stream.
pub const STREAMING_ERROR: &str = "STREAMING_ERROR";

/// Reason attached to `session/cancel` when a caller cancels.
const CANCEL_REASON: &str = "cancelled by orchestrator";

/// Result of a completed prompt turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptReceipt {
    /// Identifier of the persisted user message.
    pub message_id: String,
    /// `stopReason` reported by the agent, when present.
    pub stop_reason: Option<String>,
}

/// A session with its conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDetail {
    /// Session record.
    pub session: Session,
    /// Messages oldest first.
    pub messages: Vec<Message>,
}

/// Orchestrates agent sessions end to end.
pub struct SessionCoordinator {
    config: Arc<GlobalConfig>,
    sessions: SessionRepo,
    messages: MessageRepo,
    workspaces: WorkspaceRepo,
    supervisor: ProcessSupervisor,
    streams: SharedStreamTracker,
    hub: Arc<RealtimeHub>,
    clients: Mutex<HashMap<String, Arc<AcpClient>>>,
    /// Stream message id of each session's in-flight turn.
    turns: Mutex<HashMap<String, String>>,
    /// Sessions cancelled here whose process exit is still to come; late
    /// events for them are discarded. Pruned when the exit is handled.
    cancelled: Mutex<HashSet<String>>,
    events_tx: mpsc::Sender<AgentEvent>,
}

impl SessionCoordinator {
    /// Build a coordinator and the receiving end of its event queue.
    ///
    /// Hand the receiver to [`spawn_event_loop`](Self::spawn_event_loop).
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        db: Arc<Database>,
        hub: Arc<RealtimeHub>,
    ) -> (Arc<Self>, mpsc::Receiver<AgentEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let supervisor =
            ProcessSupervisor::new(SupervisorConfig::from_global(&config), events_tx.clone());
        let streams = Arc::new(Mutex::new(StreamTracker::new(Duration::from_secs(
            config.streaming.stream_timeout_seconds,
        ))));

        let coordinator = Arc::new(Self {
            sessions: SessionRepo::new(Arc::clone(&db)),
            messages: MessageRepo::new(Arc::clone(&db)),
            workspaces: WorkspaceRepo::new(db),
            supervisor,
            streams,
            hub,
            clients: Mutex::new(HashMap::new()),
            turns: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            events_tx,
            config,
        });
        (coordinator, events_rx)
    }

    /// The process supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// The streaming tracker shared with the sweep task.
    #[must_use]
    pub fn streams(&self) -> SharedStreamTracker {
        Arc::clone(&self.streams)
    }

    /// The fan-out hub.
    #[must_use]
    pub fn hub(&self) -> Arc<RealtimeHub> {
        Arc::clone(&self.hub)
    }

    /// Cancelled sessions whose process exit has not been handled yet.
    #[must_use]
    pub fn pending_exit_count(&self) -> usize {
        lock(&self.cancelled).len()
    }

    /// Whether a live protocol client is registered for the session.
    #[must_use]
    pub fn has_client(&self, session_id: &str) -> bool {
        lock(&self.clients).contains_key(session_id)
    }

    // ── Session lifecycle ─────────────────────────────────────────────────

    /// Start a new agent session in the given workspace.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the workspace does not exist.
    /// - `AppError::PathOutsideRoot` if the workspace is outside the
    ///   configured root.
    /// - `AppError::ResourceExhausted` at the concurrency ceiling.
    /// - Any spawn, handshake, or persistence failure; the session record
    ///   is marked `error` before the failure is returned.
    pub async fn create_session(&self, workspace_id: i64) -> Result<Session> {
        let workspace = self.workspaces.get(workspace_id).await?;
        let path = resolve_workspace_path(
            self.config.workspace_root.as_deref(),
            &PathBuf::from(&workspace.path),
        )?;

        let slot = self.supervisor.reserve()?;
        let session = self.sessions.create(&Session::new(workspace_id)).await?;
        self.hub.broadcast(&ServerEvent::session_created(&session));
        info!(session_id = session.id, workspace_id, path = %path.display(), "session created");

        match self.start_agent(slot, &session.id, &path).await {
            Ok(agent_session_id) => {
                self.sessions
                    .set_agent_session_id(&session.id, &agent_session_id)
                    .await?;
                self.sessions.get_by_id(&session.id).await
            }
            Err(err) => {
                error!(session_id = session.id, %err, "session start failed");
                self.discard_client(&session.id);
                self.supervisor.terminate(&session.id).await;
                if let Err(db_err) = self
                    .sessions
                    .update_status(&session.id, SessionStatus::Error)
                    .await
                {
                    error!(session_id = session.id, %db_err, "failed to mark session error");
                } else {
                    self.hub.broadcast(&ServerEvent::session_status(
                        &session.id,
                        SessionStatus::Error,
                    ));
                }
                Err(err)
            }
        }
    }

    async fn start_agent(
        &self,
        slot: SlotReservation,
        session_id: &str,
        path: &std::path::Path,
    ) -> Result<String> {
        let process = self.supervisor.spawn_reserved(slot, session_id, path)?;
        let client = AcpClient::spawn(
            session_id,
            process.stdout,
            process.stdin,
            self.events_tx.clone(),
            ClientTimeouts {
                session_new: self.config.session_new_timeout(),
                prompt: self.config.prompt_timeout(),
            },
        );
        lock(&self.clients).insert(session_id.to_owned(), Arc::clone(&client));

        client.create_session(&path.to_string_lossy()).await
    }

    /// Send one prompt and wait for the agent's turn to finish.
    ///
    /// The user message is persisted and broadcast before the prompt is
    /// forwarded.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` if the session does not exist or has no live
    ///   agent.
    /// - `AppError::Conflict` if the session is not active.
    /// - `AppError::Timeout` / `AppError::Protocol` if the turn fails.
    pub async fn send_prompt(&self, session_id: &str, text: &str) -> Result<PromptReceipt> {
        let session = self.sessions.get_by_id(session_id).await?;
        if !session.is_active() {
            return Err(AppError::Conflict(format!(
                "session {session_id} is not active (status: {})",
                session.status
            )));
        }

        let client = lock(&self.clients)
            .get(session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no live agent for session {session_id}")))?;

        let user_message = Message::new(
            session_id.to_owned(),
            MessageRole::User,
            &MessageContent::text(text),
        );
        self.messages.insert(&user_message).await?;
        self.hub.broadcast(&ServerEvent::message_new(&user_message));
        self.sessions.touch(session_id).await?;
        self.supervisor.update_activity(session_id);

        debug!(session_id, message_id = user_message.id, "forwarding prompt");
        let result = client.send_prompt(text).await;

        let outcome = match &result {
            Ok(value) => TurnOutcome::Completed {
                result: value.clone(),
            },
            Err(err) => TurnOutcome::Failed {
                message: err.to_string(),
            },
        };
        let turn_ended = AgentEvent::TurnEnded {
            session_id: session_id.to_owned(),
            outcome,
        };
        if self.events_tx.send(turn_ended).await.is_err() {
            debug!(session_id, "event loop gone, turn end not queued");
        }

        let result = result?;
        self.supervisor.update_activity(session_id);
        Ok(PromptReceipt {
            message_id: user_message.id,
            stop_reason: result
                .get("stopReason")
                .and_then(Value::as_str)
                .map(str::to_owned),
        })
    }

    /// Cancel a session: best-effort agent cancel, process termination, and
    /// an unconditional move to `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the status update fails.
    pub async fn cancel_session(&self, session_id: &str) -> Result<Session> {
        self.sessions.get_by_id(session_id).await?;
        if self.supervisor.is_running(session_id) {
            lock(&self.cancelled).insert(session_id.to_owned());
        }

        let client = lock(&self.clients).remove(session_id);
        if let Some(client) = client {
            if let Err(err) = client.cancel_session(Some(CANCEL_REASON)).await {
                warn!(session_id, %err, "agent cancel failed, continuing");
            }
            client.close_and_flush().await;
        }
        self.abandon_turn(session_id);
        self.supervisor.terminate(session_id).await;

        let session = self
            .sessions
            .update_status(session_id, SessionStatus::Cancelled)
            .await?;
        self.hub.broadcast(&ServerEvent::session_status(
            session_id,
            SessionStatus::Cancelled,
        ));
        info!(session_id, "session cancelled");
        Ok(session)
    }

    /// Cancel every session idle beyond the configured threshold.
    ///
    /// Returns the number of sessions cancelled. Per-session failures are
    /// logged and skipped.
    pub async fn cleanup_idle_sessions(&self) -> usize {
        let idle = self
            .supervisor
            .get_idle_sessions(self.config.session_idle_threshold());
        let mut cancelled = 0;

        for session_id in idle {
            info!(session_id, "cancelling idle session");
            match self.cancel_session(&session_id).await {
                Ok(_) => cancelled += 1,
                Err(err) => warn!(session_id, %err, "idle session cleanup failed"),
            }
        }
        cancelled
    }

    /// Close every client, terminate every process, and cancel every session
    /// still `active`. Failures are logged; calling twice is harmless.
    pub async fn shutdown_all_sessions(&self) {
        let clients: Vec<(String, Arc<AcpClient>)> = lock(&self.clients).drain().collect();
        for (session_id, client) in &clients {
            if self.supervisor.is_running(session_id) {
                lock(&self.cancelled).insert(session_id.clone());
            }
            if let Err(err) = client.cancel_session(Some("orchestrator shutdown")).await {
                warn!(session_id, %err, "agent cancel failed during shutdown");
            }
            client.close_and_flush().await;
            self.abandon_turn(session_id);
        }

        self.supervisor.terminate_all().await;

        match self.sessions.mark_all_active(SessionStatus::Cancelled).await {
            Ok(ids) => {
                for session_id in &ids {
                    self.hub.broadcast(&ServerEvent::session_status(
                        session_id,
                        SessionStatus::Cancelled,
                    ));
                }
                info!(
                    clients = clients.len(),
                    sessions = ids.len(),
                    awaiting_exit = self.pending_exit_count(),
                    "all sessions shut down"
                );
            }
            Err(err) => error!(%err, "failed to cancel active sessions during shutdown"),
        }
    }

    /// Cancel sessions left `active` by a previous run that did not shut
    /// down cleanly. Call once at startup, before any session is created.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn recover_orphaned_sessions(&self) -> Result<usize> {
        let ids = self.sessions.mark_all_active(SessionStatus::Cancelled).await?;
        if !ids.is_empty() {
            warn!(count = ids.len(), "cancelled sessions orphaned by a previous run");
        }
        Ok(ids.len())
    }

    // ── Read APIs ─────────────────────────────────────────────────────────

    /// Sessions newest first with the total matching count.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Session>, u64)> {
        self.sessions.list(filter, limit, offset).await
    }

    /// One session with all of its messages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_session(&self, session_id: &str) -> Result<SessionDetail> {
        let session = self.sessions.get_by_id(session_id).await?;
        let messages = self.messages.list_for_session(session_id, None).await?;
        Ok(SessionDetail { session, messages })
    }

    /// A session's messages, optionally only those after `since`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub async fn get_messages(
        &self,
        session_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>> {
        self.sessions.get_by_id(session_id).await?;
        self.messages.list_for_session(session_id, since).await
    }

    /// Every registered workspace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.workspaces.list().await
    }

    // ── Event handling ────────────────────────────────────────────────────

    /// Apply one agent or process event.
    pub async fn handle_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::SessionUpdate { session_id, params } => {
                self.on_session_update(&session_id, params).await;
            }
            AgentEvent::Notification {
                session_id, method, ..
            } => {
                self.supervisor.update_activity(&session_id);
                debug!(session_id, method, "agent notification ignored");
            }
            AgentEvent::ProtocolError { session_id, error } => {
                warn!(session_id, %error, "agent protocol error");
                self.transition(&session_id, SessionStatus::Error).await;
            }
            AgentEvent::ParseError { session_id, error, .. } => {
                debug!(session_id, error, "agent stdout line skipped");
            }
            AgentEvent::StreamClosed { session_id } => {
                debug!(session_id, "agent stdout closed");
            }
            AgentEvent::ProcessExited {
                session_id,
                exit_code,
                signal,
                expected,
            } => {
                self.discard_client(&session_id);
                let was_cancelled = lock(&self.cancelled).remove(&session_id);
                if expected || was_cancelled {
                    debug!(session_id, ?exit_code, "agent exit after terminate");
                    return;
                }
                let status = if exit_code == Some(0) {
                    SessionStatus::Completed
                } else {
                    SessionStatus::Error
                };
                info!(session_id, ?exit_code, ?signal, %status, "agent exited on its own");
                self.transition(&session_id, status).await;
            }
            AgentEvent::ProcessStderr { session_id, message } => {
                debug!(session_id, message, "agent stderr recorded");
            }
            AgentEvent::ProcessError { session_id, error } => {
                warn!(session_id, error, "agent process wait failed");
                self.discard_client(&session_id);
                lock(&self.cancelled).remove(&session_id);
                self.transition(&session_id, SessionStatus::Error).await;
            }
            AgentEvent::TurnEnded {
                session_id,
                outcome,
            } => self.on_turn_ended(&session_id, outcome),
        }
    }

    async fn on_session_update(&self, session_id: &str, params: Value) {
        if lock(&self.cancelled).contains(session_id) {
            debug!(session_id, "update for cancelled session discarded");
            return;
        }
        self.supervisor.update_activity(session_id);
        lock_tracker(&self.streams).touch_stream(session_id);

        let update: SessionUpdateParams = match serde_json::from_value(params) {
            Ok(update) => update,
            Err(err) => {
                warn!(session_id, %err, "malformed session/update params");
                return;
            }
        };

        let kind = update.kind();
        if kind != Some(UPDATE_AGENT_MESSAGE_CHUNK) {
            debug!(session_id, kind = kind.unwrap_or("<none>"), "session update not persisted");
            return;
        }

        let text = update
            .content_text()
            .unwrap_or_else(|| update.update.to_string());
        let message = Message::new(
            session_id.to_owned(),
            MessageRole::Agent,
            &MessageContent::text(text.as_str()),
        );
        if let Err(err) = self.messages.insert(&message).await {
            error!(session_id, %err, "failed to persist agent message");
            return;
        }
        self.hub.broadcast(&ServerEvent::message_new(&message));
        if let Err(err) = self.sessions.touch(session_id).await {
            debug!(session_id, %err, "failed to touch session");
        }

        self.accumulate_turn(session_id, &text);
    }

    fn accumulate_turn(&self, session_id: &str, text: &str) {
        let stream_id = lock(&self.turns)
            .entry(session_id.to_owned())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        let mut streams = lock_tracker(&self.streams);
        streams.start_stream(&stream_id, session_id);
        if let Err(err) = streams.add_chunk(&stream_id, text) {
            warn!(session_id, %err, "turn stream chunk dropped");
        }
    }

    fn on_turn_ended(&self, session_id: &str, outcome: TurnOutcome) {
        let stream_id = lock(&self.turns).remove(session_id);

        match outcome {
            TurnOutcome::Completed { .. } => {
                let Some(stream_id) = stream_id else {
                    debug!(session_id, "turn ended without streamed text");
                    return;
                };
                match lock_tracker(&self.streams).complete_stream(&stream_id) {
                    Ok(text) => {
                        self.hub.broadcast(&ServerEvent::message_update(
                            session_id,
                            &stream_id,
                            &MessageContent::text(text),
                            true,
                        ));
                    }
                    Err(err) => debug!(session_id, %err, "turn stream already gone"),
                }
            }
            TurnOutcome::Failed { message } => {
                if let Some(stream_id) = &stream_id {
                    lock_tracker(&self.streams).cancel_stream(stream_id);
                }
                if lock(&self.cancelled).contains(session_id) {
                    return;
                }
                warn!(session_id, error = message, "prompt turn failed");
                self.hub.broadcast(&ServerEvent::error(
                    STREAMING_ERROR,
                    &message,
                    json!({ "sessionId": session_id, "messageId": stream_id }),
                ));
            }
        }
    }

    /// Move an `active` session to `status` and broadcast the change.
    async fn transition(&self, session_id: &str, status: SessionStatus) {
        match self.sessions.transition_if_active(session_id, status).await {
            Ok(true) => {
                info!(session_id, %status, "session status changed");
                self.hub
                    .broadcast(&ServerEvent::session_status(session_id, status));
            }
            Ok(false) => debug!(session_id, %status, "session no longer active, transition skipped"),
            Err(err) => error!(session_id, %err, "failed to update session status"),
        }
    }

    fn discard_client(&self, session_id: &str) {
        if let Some(client) = lock(&self.clients).remove(session_id) {
            client.close();
        }
        self.abandon_turn(session_id);
    }

    fn abandon_turn(&self, session_id: &str) {
        if let Some(stream_id) = lock(&self.turns).remove(session_id) {
            lock_tracker(&self.streams).cancel_stream(&stream_id);
        }
    }

    // ── Background tasks ──────────────────────────────────────────────────

    /// Spawn the single consumer of the event queue.
    #[must_use]
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events_rx: mpsc::Receiver<AgentEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("coordinator event loop shutting down");
                            break;
                        }
                        event = events_rx.recv() => match event {
                            Some(event) => coordinator.handle_event(event).await,
                            None => break,
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("coordinator_events")),
        )
    }

    /// Spawn the periodic idle-session sweep.
    #[must_use]
    pub fn spawn_idle_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("idle cleanup shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let cancelled = coordinator.cleanup_idle_sessions().await;
                        if cancelled > 0 {
                            info!(cancelled, "idle sessions cleaned up");
                        }
                    }
                }
            }
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
