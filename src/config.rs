//! Global configuration parsing, validation, and environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Protocol response windows and process shutdown timing (seconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Window for the `session/new` handshake response.
    #[serde(default = "default_session_new_seconds")]
    pub session_new_seconds: u64,
    /// Window for a `session/prompt` turn to complete.
    #[serde(default = "default_prompt_seconds")]
    pub prompt_seconds: u64,
    /// Grace period between the termination signal and a forced kill.
    #[serde(default = "default_terminate_grace_seconds")]
    pub terminate_grace_seconds: u64,
    /// Window for the startup `--version` probe of the agent binary.
    #[serde(default = "default_verify_seconds")]
    pub verify_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            session_new_seconds: default_session_new_seconds(),
            prompt_seconds: default_prompt_seconds(),
            terminate_grace_seconds: default_terminate_grace_seconds(),
            verify_seconds: default_verify_seconds(),
        }
    }
}

fn default_session_new_seconds() -> u64 {
    30
}

fn default_prompt_seconds() -> u64 {
    300
}

fn default_terminate_grace_seconds() -> u64 {
    5
}

fn default_verify_seconds() -> u64 {
    5
}

/// Idle-session cleanup policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct IdleConfig {
    /// Sessions without protocol activity for this many minutes are cancelled.
    #[serde(default = "default_session_idle_minutes")]
    pub session_idle_minutes: u64,
    /// How often the idle sweep runs.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            session_idle_minutes: default_session_idle_minutes(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

fn default_session_idle_minutes() -> u64 {
    30
}

fn default_cleanup_interval_seconds() -> u64 {
    300
}

/// Streaming accumulator sweep policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StreamingConfig {
    /// A stream with no chunk for this long is discarded.
    #[serde(default = "default_stream_timeout_seconds")]
    pub stream_timeout_seconds: u64,
    /// How often timed-out streams are swept.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            stream_timeout_seconds: default_stream_timeout_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

fn default_stream_timeout_seconds() -> u64 {
    60
}

fn default_sweep_interval_seconds() -> u64 {
    30
}

/// Fan-out channel liveness policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RealtimeConfig {
    /// How often stale observers are swept.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// Observers silent for longer than this are disconnected.
    #[serde(default = "default_client_timeout_seconds")]
    pub client_timeout_seconds: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            client_timeout_seconds: default_client_timeout_seconds(),
        }
    }
}

fn default_heartbeat_interval_seconds() -> u64 {
    30
}

fn default_client_timeout_seconds() -> u64 {
    60
}

/// A workspace seeded into the store at startup.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkspaceSeed {
    /// Stable workspace identifier referenced by sessions.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Checkout directory the agent runs in.
    pub path: PathBuf,
}

fn default_agent_cli() -> String {
    "gemini".into()
}

fn default_agent_cli_args() -> Vec<String> {
    vec!["--experimental-acp".into()]
}

fn default_max_concurrent_sessions() -> u32 {
    5
}

fn default_http_host() -> String {
    "127.0.0.1".into()
}

fn default_http_port() -> u16 {
    4000
}

fn default_db_path() -> String {
    "acp-orchestrator.db".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// External agent binary.
    #[serde(default = "default_agent_cli")]
    pub agent_cli: String,
    /// Arguments switching the agent into its stdio protocol mode.
    #[serde(default = "default_agent_cli_args")]
    pub agent_cli_args: Vec<String>,
    /// Maximum concurrent agent processes.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: u32,
    /// Optional root every workspace path must live under.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Interface the HTTP server binds to.
    #[serde(default = "default_http_host")]
    pub http_host: String,
    /// HTTP port for the API and fan-out channel.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// `SQLite` database file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Protocol and process timing.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Idle-session cleanup.
    #[serde(default)]
    pub idle: IdleConfig,
    /// Streaming accumulator sweep.
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Fan-out liveness.
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// Workspaces registered at startup.
    #[serde(default)]
    pub workspaces: Vec<WorkspaceSeed>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            agent_cli: default_agent_cli(),
            agent_cli_args: default_agent_cli_args(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            workspace_root: None,
            http_host: default_http_host(),
            http_port: default_http_port(),
            db_path: default_db_path(),
            timeouts: TimeoutConfig::default(),
            idle: IdleConfig::default(),
            streaming: StreamingConfig::default(),
            realtime: RealtimeConfig::default(),
            workspaces: Vec::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `AGENT_*` environment overrides on top of the parsed file.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `AGENT_CLI_PATH` | `agent_cli` |
    /// | `AGENT_MAX_CONCURRENT_SESSIONS` | `max_concurrent_sessions` |
    /// | `AGENT_WORKSPACE_ROOT` | `workspace_root` |
    /// | `AGENT_SESSION_IDLE_TIMEOUT` | `idle.session_idle_minutes` |
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a numeric override does not parse or the
    /// resulting configuration fails validation.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(cli) = non_empty_var("AGENT_CLI_PATH") {
            self.agent_cli = cli;
        }
        if let Some(raw) = non_empty_var("AGENT_MAX_CONCURRENT_SESSIONS") {
            self.max_concurrent_sessions = raw.parse().map_err(|err| {
                AppError::Config(format!("AGENT_MAX_CONCURRENT_SESSIONS invalid: {err}"))
            })?;
        }
        if let Some(root) = non_empty_var("AGENT_WORKSPACE_ROOT") {
            self.workspace_root = Some(PathBuf::from(root));
        }
        if let Some(raw) = non_empty_var("AGENT_SESSION_IDLE_TIMEOUT") {
            self.idle.session_idle_minutes = raw.parse().map_err(|err| {
                AppError::Config(format!("AGENT_SESSION_IDLE_TIMEOUT invalid: {err}"))
            })?;
        }
        self.validate()
    }

    /// Window for the `session/new` handshake.
    #[must_use]
    pub fn session_new_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.session_new_seconds)
    }

    /// Window for a prompt turn.
    #[must_use]
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.prompt_seconds)
    }

    /// Grace period before a forced kill.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.terminate_grace_seconds)
    }

    /// Window for the startup `--version` probe.
    #[must_use]
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.verify_seconds)
    }

    /// Idle threshold after which a session is cancelled.
    #[must_use]
    pub fn session_idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle.session_idle_minutes.saturating_mul(60))
    }

    fn validate(&mut self) -> Result<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }

        if self.agent_cli.trim().is_empty() {
            return Err(AppError::Config("agent_cli must not be empty".into()));
        }

        if self.timeouts.session_new_seconds == 0 || self.timeouts.prompt_seconds == 0 {
            return Err(AppError::Config(
                "protocol timeouts must be greater than zero".into(),
            ));
        }

        if self.streaming.sweep_interval_seconds == 0
            || self.realtime.heartbeat_interval_seconds == 0
            || self.idle.cleanup_interval_seconds == 0
        {
            return Err(AppError::Config(
                "sweep intervals must be greater than zero".into(),
            ));
        }

        // A root that cannot be canonicalized is kept as written; the
        // confinement check then compares normalized paths instead.
        if let Some(root) = &self.workspace_root {
            match root.canonicalize() {
                Ok(canonical) => self.workspace_root = Some(canonical),
                Err(err) => {
                    warn!(root = %root.display(), %err, "workspace_root could not be canonicalized");
                }
            }
        }

        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
