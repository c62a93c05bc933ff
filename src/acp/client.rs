//! Protocol client: one instance per agent process.
//!
//! [`AcpClient::spawn`] starts a reader task over the agent's stdout and a
//! writer task over its stdin, then exposes the ACP request primitives.
//! Request ids are assigned from 1 upward per client. Correlation is by id
//! only; responses may arrive in any order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::acp::message::{
    self, METHOD_SESSION_CANCEL, METHOD_SESSION_NEW, METHOD_SESSION_PROMPT,
};
use crate::acp::reader::{run_reader, PendingRequests, ReaderContext};
use crate::acp::writer::run_writer;
use crate::events::AgentEvent;
use crate::{AppError, Result};

/// Capacity of the outbound frame queue.
const OUTBOUND_CAPACITY: usize = 64;

/// How long [`AcpClient::close_and_flush`] waits for the writer to finish.
const FLUSH_WINDOW: Duration = Duration::from_secs(3);

/// Response windows for the two awaited requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// `session/new` window.
    pub session_new: Duration,
    /// `session/prompt` window.
    pub prompt: Duration,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            session_new: Duration::from_secs(30),
            prompt: Duration::from_secs(300),
        }
    }
}

/// JSON-RPC client bound to one agent process's stdio.
pub struct AcpClient {
    session_id: String,
    next_id: AtomicU64,
    pending: Arc<PendingRequests>,
    outbound: mpsc::Sender<Value>,
    agent_session_id: RwLock<Option<String>>,
    timeouts: ClientTimeouts,
    cancel: CancellationToken,
    closed: AtomicBool,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpClient")
            .field("session_id", &self.session_id)
            .field("agent_session_id", &self.agent_session_id())
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl AcpClient {
    /// Wire a client to an agent's stdout (`reader`) and stdin (`writer`).
    ///
    /// Inbound notifications and errors are delivered on `events`.
    #[must_use]
    pub fn spawn<R, W>(
        session_id: impl Into<String>,
        reader: R,
        writer: W,
        events: mpsc::Sender<AgentEvent>,
        timeouts: ClientTimeouts,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = session_id.into();
        let cancel = CancellationToken::new();
        let pending = Arc::new(PendingRequests::default());
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let ctx = ReaderContext {
            session_id: session_id.clone(),
            pending: Arc::clone(&pending),
            outbound: outbound.clone(),
            events,
        };
        let span = tracing::info_span!("acp_client", session_id = %session_id);
        tokio::spawn(run_reader(ctx, reader, cancel.clone()).instrument(span.clone()));

        let writer_session = session_id.clone();
        let writer_cancel = cancel.clone();
        let writer_task = tokio::spawn(
            async move {
                if let Err(err) =
                    run_writer(writer_session, writer, outbound_rx, writer_cancel).await
                {
                    warn!(%err, "acp writer exited with error");
                }
            }
            .instrument(span),
        );

        Arc::new(Self {
            session_id,
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            agent_session_id: RwLock::new(None),
            timeouts,
            cancel,
            closed: AtomicBool::new(false),
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    /// Orchestrator session this client serves.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Agent-assigned session id, once the handshake has succeeded.
    #[must_use]
    pub fn agent_session_id(&self) -> Option<String> {
        self.agent_session_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Open an agent-side session rooted at `cwd` (`session/new`).
    ///
    /// # Errors
    ///
    /// - `AppError::Timeout` if no response arrives within the window.
    /// - `AppError::Protocol` if the agent answers with an error, the result
    ///   lacks `sessionId`, or the stream closes first.
    pub async fn create_session(&self, cwd: &str) -> Result<String> {
        let result = self
            .request(
                METHOD_SESSION_NEW,
                message::session_new_params(cwd),
                self.timeouts.session_new,
            )
            .await?;

        let agent_session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Protocol("session/new result missing sessionId".into()))?
            .to_owned();

        *self
            .agent_session_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(agent_session_id.clone());
        info!(session_id = %self.session_id, agent_session_id, "agent session created");
        Ok(agent_session_id)
    }

    /// Run one prompt turn (`session/prompt`) and return the response result.
    ///
    /// Streaming output arrives as [`AgentEvent::SessionUpdate`] events
    /// before this resolves.
    ///
    /// # Errors
    ///
    /// - `AppError::NotInitialized` if [`create_session`](Self::create_session)
    ///   has not succeeded.
    /// - `AppError::Timeout` if the turn outlives its window.
    /// - `AppError::Protocol` if the agent answers with an error or the
    ///   stream closes first.
    pub async fn send_prompt(&self, text: &str) -> Result<Value> {
        let agent_session_id = self.agent_session_id().ok_or_else(|| {
            AppError::NotInitialized("session/new has not completed for this client".into())
        })?;

        self.request(
            METHOD_SESSION_PROMPT,
            message::session_prompt_params(&agent_session_id, text),
            self.timeouts.prompt,
        )
        .await
    }

    /// Ask the agent to stop the current turn (`session/cancel`).
    ///
    /// Sent without waiting for a response; a no-op before the handshake.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the client is already closed.
    pub async fn cancel_session(&self, reason: Option<&str>) -> Result<()> {
        let Some(agent_session_id) = self.agent_session_id() else {
            debug!(session_id = %self.session_id, "cancel before handshake, nothing to send");
            return Ok(());
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = message::request(
            id,
            METHOD_SESSION_CANCEL,
            message::session_cancel_params(&agent_session_id, reason),
        );
        self.write(frame).await
    }

    /// Stop the reader and writer tasks and close the agent's stdin.
    ///
    /// Frames already queued (such as a `session/cancel`) are still written
    /// by the writer before it closes stdin. Outstanding requests fail with
    /// `AppError::Protocol`. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.pending.clear();
        debug!(session_id = %self.session_id, "acp client closed");
    }

    /// [`close`](Self::close), then wait for the writer to flush the queue
    /// and close stdin.
    pub async fn close_and_flush(&self) {
        self.close();
        let task = self
            .writer_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if tokio::time::timeout(FLUSH_WINDOW, task).await.is_err() {
                warn!(session_id = %self.session_id, "acp writer did not finish flushing");
            }
        }
    }

    async fn request(&self, method: &str, params: Value, window: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = self.pending.register(id);

        if let Err(err) = self.write(message::request(id, method, params)).await {
            self.pending.remove(id);
            return Err(err);
        }
        debug!(session_id = %self.session_id, request_id = id, method, "request sent");

        match tokio::time::timeout(window, rx).await {
            Err(_elapsed) => {
                self.pending.remove(id);
                Err(AppError::Timeout(format!(
                    "{method} got no response within {}s",
                    window.as_secs()
                )))
            }
            Ok(Err(_closed)) => Err(AppError::Protocol(format!(
                "agent stream closed before {method} response"
            ))),
            Ok(Ok(Err(rpc))) => Err(AppError::Protocol(format!("{method} failed: {rpc}"))),
            Ok(Ok(Ok(result))) => Ok(result),
        }
    }

    async fn write(&self, frame: Value) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::Protocol("acp client is closed".into()));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| AppError::Protocol("agent stdin is closed".into()))
    }
}

impl Drop for AcpClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
