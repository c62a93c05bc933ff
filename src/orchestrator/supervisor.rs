//! Process supervisor: one agent subprocess per session.
//!
//! The supervisor exclusively owns every [`tokio::process::Child`]. Each
//! child is moved into a monitor task that awaits its exit and reports it as
//! [`AgentEvent::ProcessExited`]; stderr is drained by a second task and
//! reported as [`AgentEvent::ProcessStderr`]. The live-process table, plus
//! the slots reserved for spawns still in preparation, is the only shared
//! counter behind the concurrency ceiling. Every check-then-increment on it
//! happens under one lock acquisition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn, Instrument};

use crate::config::GlobalConfig;
use crate::events::AgentEvent;
use crate::{AppError, Result};

/// Launch and shutdown parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Agent binary.
    pub program: String,
    /// Arguments selecting the stdio protocol mode.
    pub args: Vec<String>,
    /// Maximum live processes.
    pub max_concurrent: usize,
    /// Wait between the termination signal and a forced kill.
    pub terminate_grace: Duration,
    /// Window for the `--version` probe.
    pub verify_timeout: Duration,
}

impl SupervisorConfig {
    /// Derive supervisor settings from the global configuration.
    #[must_use]
    pub fn from_global(config: &GlobalConfig) -> Self {
        Self {
            program: config.agent_cli.clone(),
            args: config.agent_cli_args.clone(),
            max_concurrent: usize::try_from(config.max_concurrent_sessions).unwrap_or(usize::MAX),
            terminate_grace: config.terminate_grace(),
            verify_timeout: config.verify_timeout(),
        }
    }
}

/// Stdio handles of a freshly spawned agent, handed to the protocol client.
#[derive(Debug)]
pub struct AgentProcess {
    /// OS process id, when the platform reports one.
    pub pid: Option<u32>,
    /// Write end of the agent's stdin.
    pub stdin: ChildStdin,
    /// Read end of the agent's stdout.
    pub stdout: ChildStdout,
}

/// Snapshot of one tracked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Owning session.
    pub session_id: String,
    /// OS process id.
    pub pid: Option<u32>,
    /// Working directory.
    pub workspace_path: PathBuf,
    /// Spawn time.
    pub started_at: Instant,
    /// Last protocol activity.
    pub last_activity: Instant,
}

struct ProcessEntry {
    pid: Option<u32>,
    workspace_path: PathBuf,
    started_at: Instant,
    last_activity: Instant,
    exited: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
    expected_exit: Arc<AtomicBool>,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<String, ProcessEntry>,
    reserved: usize,
}

impl TableState {
    fn occupied(&self) -> usize {
        self.entries.len() + self.reserved
    }
}

type ProcessTable = Arc<Mutex<TableState>>;

/// A concurrency slot held for a spawn that has not happened yet.
///
/// Counts against the ceiling until it is consumed by
/// [`ProcessSupervisor::spawn_reserved`] or dropped.
pub struct SlotReservation {
    table: ProcessTable,
    consumed: bool,
}

impl SlotReservation {
    fn consume(mut self, state: &mut TableState) {
        state.reserved = state.reserved.saturating_sub(1);
        self.consumed = true;
    }
}

impl std::fmt::Debug for SlotReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotReservation")
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if !self.consumed {
            let mut state = lock(&self.table);
            state.reserved = state.reserved.saturating_sub(1);
        }
    }
}

/// Spawns, tracks, and terminates agent subprocesses.
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    processes: ProcessTable,
    events: mpsc::Sender<AgentEvent>,
}

impl ProcessSupervisor {
    /// Create a supervisor reporting process events on `events`.
    #[must_use]
    pub fn new(config: SupervisorConfig, events: mpsc::Sender<AgentEvent>) -> Self {
        Self {
            config,
            processes: Arc::new(Mutex::new(TableState::default())),
            events,
        }
    }

    /// Claim a concurrency slot ahead of a spawn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhausted` when live processes plus
    /// outstanding reservations already reach the ceiling.
    pub fn reserve(&self) -> Result<SlotReservation> {
        let mut state = lock(&self.processes);
        if state.occupied() >= self.config.max_concurrent {
            return Err(exhausted(self.config.max_concurrent));
        }
        state.reserved += 1;
        Ok(SlotReservation {
            table: Arc::clone(&self.processes),
            consumed: false,
        })
    }

    /// Launch the agent for `session_id` in `workspace_path`.
    ///
    /// Shorthand for [`reserve`](Self::reserve) followed by
    /// [`spawn_reserved`](Self::spawn_reserved).
    ///
    /// # Errors
    ///
    /// - `AppError::ResourceExhausted` at the concurrency ceiling.
    /// - `AppError::Conflict` if the session already has a live process.
    /// - `AppError::Spawn` if the OS refuses to start the process.
    pub fn spawn(&self, session_id: &str, workspace_path: &Path) -> Result<AgentProcess> {
        let slot = self.reserve()?;
        self.spawn_reserved(slot, session_id, workspace_path)
    }

    /// Launch the agent into a previously reserved slot.
    ///
    /// On failure the slot is released.
    ///
    /// # Errors
    ///
    /// - `AppError::Conflict` if the session already has a live process.
    /// - `AppError::Spawn` if the OS refuses to start the process.
    pub fn spawn_reserved(
        &self,
        slot: SlotReservation,
        session_id: &str,
        workspace_path: &Path,
    ) -> Result<AgentProcess> {
        let mut table = lock(&self.processes);

        if table.entries.contains_key(session_id) {
            drop(table);
            return Err(AppError::Conflict(format!(
                "session {session_id} already has a live agent process"
            )));
        }

        let launched = match self.launch(workspace_path) {
            Ok(launched) => launched,
            Err(err) => {
                drop(table);
                return Err(err);
            }
        };
        let Launched {
            child,
            stdin,
            stdout,
            stderr,
        } = launched;
        let pid = child.id();

        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();
        let expected_exit = Arc::new(AtomicBool::new(false));
        let now = Instant::now();

        slot.consume(&mut table);
        table.entries.insert(
            session_id.to_owned(),
            ProcessEntry {
                pid,
                workspace_path: workspace_path.to_path_buf(),
                started_at: now,
                last_activity: now,
                exited: exited_rx,
                kill_tx: Some(kill_tx),
                expected_exit: Arc::clone(&expected_exit),
            },
        );
        drop(table);

        let span = tracing::info_span!("agent_process", session_id, pid);
        if let Some(stderr) = stderr {
            tokio::spawn(
                drain_stderr(session_id.to_owned(), stderr, self.events.clone())
                    .instrument(span.clone()),
            );
        }
        tokio::spawn(
            monitor_exit(
                ExitMonitor {
                    session_id: session_id.to_owned(),
                    processes: Arc::clone(&self.processes),
                    events: self.events.clone(),
                    exited: exited_tx,
                    expected_exit,
                },
                child,
                kill_rx,
            )
            .instrument(span),
        );

        info!(session_id, ?pid, workspace = %workspace_path.display(), "agent process spawned");
        Ok(AgentProcess { pid, stdin, stdout })
    }

    fn launch(&self, workspace_path: &Path) -> Result<Launched> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .current_dir(workspace_path)
            .env("NO_COLOR", "1")
            .env("TERM", "dumb")
            .env("CI", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AppError::Spawn(format!(
                    "failed to launch {}: {err}",
                    self.config.program
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
        let stderr = child.stderr.take();
        Ok(Launched {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    /// Stop the session's process: termination signal, grace window, then kill.
    ///
    /// A no-op when the session has no live process. The table entry is
    /// always gone when this returns.
    pub async fn terminate(&self, session_id: &str) {
        let (pid, mut exited, kill_tx) = {
            let mut table = lock(&self.processes);
            let Some(entry) = table.entries.get_mut(session_id) else {
                debug!(session_id, "terminate: no live process");
                return;
            };
            entry.expected_exit.store(true, Ordering::SeqCst);
            (entry.pid, entry.exited.clone(), entry.kill_tx.take())
        };

        if !*exited.borrow() {
            send_terminate_signal(session_id, pid);

            let grace = self.config.terminate_grace;
            let graceful = tokio::time::timeout(grace, exited.wait_for(|done| *done))
                .await
                .is_ok();

            if !graceful {
                warn!(session_id, ?pid, grace_secs = grace.as_secs(), "agent ignored termination signal, killing");
                if let Some(kill_tx) = kill_tx {
                    let _ = kill_tx.send(());
                }
                let _ = exited.wait_for(|done| *done).await;
            }
        }

        lock(&self.processes).entries.remove(session_id);
        info!(session_id, ?pid, "agent process terminated");
    }

    /// Terminate every tracked process concurrently.
    pub async fn terminate_all(&self) {
        let ids: Vec<String> = lock(&self.processes).entries.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "terminating all agent processes");
        futures_util::future::join_all(ids.iter().map(|id| self.terminate(id))).await;
    }

    /// Sessions whose last activity is older than `threshold`.
    #[must_use]
    pub fn get_idle_sessions(&self, threshold: Duration) -> Vec<String> {
        self.get_idle_sessions_at(threshold, Instant::now())
    }

    /// [`get_idle_sessions`](Self::get_idle_sessions) against an explicit clock.
    #[must_use]
    pub fn get_idle_sessions_at(&self, threshold: Duration, now: Instant) -> Vec<String> {
        lock(&self.processes)
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_activity) > threshold)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Record protocol activity for the session.
    pub fn update_activity(&self, session_id: &str) {
        if let Some(entry) = lock(&self.processes).entries.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Probe the agent binary with `--version`.
    ///
    /// Returns `false` when the binary is missing, exits non-zero, or does
    /// not finish within the verify window.
    pub async fn verify(&self) -> bool {
        let status = Command::new(&self.config.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.config.verify_timeout, status).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(err)) => {
                debug!(program = self.config.program, %err, "agent verify failed to launch");
                false
            }
            Err(_elapsed) => {
                debug!(program = self.config.program, "agent verify timed out");
                false
            }
        }
    }

    /// Snapshot of one tracked process.
    #[must_use]
    pub fn process_info(&self, session_id: &str) -> Option<ProcessInfo> {
        lock(&self.processes).entries.get(session_id).map(|entry| ProcessInfo {
            session_id: session_id.to_owned(),
            pid: entry.pid,
            workspace_path: entry.workspace_path.clone(),
            started_at: entry.started_at,
            last_activity: entry.last_activity,
        })
    }

    /// Whether the session has a tracked process.
    #[must_use]
    pub fn is_running(&self, session_id: &str) -> bool {
        lock(&self.processes).entries.contains_key(session_id)
    }

    /// Number of tracked processes.
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.processes).entries.len()
    }

    /// Whether a new reservation would be refused.
    #[must_use]
    pub fn is_at_limit(&self) -> bool {
        lock(&self.processes).occupied() >= self.config.max_concurrent
    }
}

struct Launched {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
}

fn exhausted(max_concurrent: usize) -> AppError {
    AppError::ResourceExhausted(format!(
        "maximum concurrent sessions ({max_concurrent}) reached"
    ))
}

// ── Background tasks ─────────────────────────────────────────────────────────

struct ExitMonitor {
    session_id: String,
    processes: ProcessTable,
    events: mpsc::Sender<AgentEvent>,
    exited: watch::Sender<bool>,
    expected_exit: Arc<AtomicBool>,
}

async fn monitor_exit(monitor: ExitMonitor, mut child: Child, kill_rx: oneshot::Receiver<()>) {
    let session_id = monitor.session_id;

    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(err) = child.start_kill() {
                warn!(session_id, %err, "failed to kill agent process");
            }
            child.wait().await
        }
    };

    let _ = monitor.exited.send(true);
    lock(&monitor.processes).entries.remove(&session_id);
    let expected = monitor.expected_exit.load(Ordering::SeqCst);

    let event = match status {
        Ok(status) => {
            let exit_code = status.code();
            let signal = exit_signal(&status);
            info!(session_id, ?exit_code, ?signal, expected, "agent process exited");
            AgentEvent::ProcessExited {
                session_id: session_id.clone(),
                exit_code,
                signal,
                expected,
            }
        }
        Err(err) => {
            warn!(session_id, %err, "error waiting for agent process");
            AgentEvent::ProcessError {
                session_id: session_id.clone(),
                error: err.to_string(),
            }
        }
    };

    if monitor.events.send(event).await.is_err() {
        debug!(session_id, "event consumer gone before process exit was delivered");
    }
}

async fn drain_stderr(session_id: String, stderr: ChildStderr, events: mpsc::Sender<AgentEvent>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                warn!(session_id, stderr = line, "agent stderr");
                let event = AgentEvent::ProcessStderr {
                    session_id: session_id.clone(),
                    message: line,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(session_id, %err, "agent stderr read failed");
                break;
            }
        }
    }
}

// ── Platform helpers ─────────────────────────────────────────────────────────

#[cfg(unix)]
fn send_terminate_signal(session_id: &str, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(session_id, pid = raw, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn send_terminate_signal(session_id: &str, pid: Option<u32>) {
    // No graceful signal off unix; the grace window elapses into a kill.
    debug!(session_id, ?pid, "no termination signal on this platform");
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn lock(table: &ProcessTable) -> MutexGuard<'_, TableState> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}
