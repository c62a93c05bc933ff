#![forbid(unsafe_code)]

//! `acp-orchestrator`: supervises ACP coding-agent sessions and serves the
//! sessions API and realtime fan-out channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_orchestrator::config::GlobalConfig;
use acp_orchestrator::http::{self, AppState};
use acp_orchestrator::orchestrator::coordinator::SessionCoordinator;
use acp_orchestrator::orchestrator::streaming::spawn_stream_sweeper;
use acp_orchestrator::persistence::db;
use acp_orchestrator::persistence::workspace_repo::WorkspaceRepo;
use acp_orchestrator::realtime::{spawn_liveness_sweep, RealtimeHub};
use acp_orchestrator::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-orchestrator", about = "ACP agent session orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP port.
    #[arg(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("acp-orchestrator bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(port) = args.port {
        config.http_port = port;
    }
    let config = Arc::new(config);
    info!(
        agent_cli = config.agent_cli,
        max_sessions = config.max_concurrent_sessions,
        "configuration loaded"
    );

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    let workspaces = WorkspaceRepo::new(Arc::clone(&db));
    for seed in &config.workspaces {
        workspaces
            .upsert(seed.id, &seed.name, &seed.path.to_string_lossy())
            .await?;
    }
    info!(workspaces = config.workspaces.len(), "database connected");

    // ── Build the coordinator ───────────────────────────
    let hub = Arc::new(RealtimeHub::new(Duration::from_secs(
        config.realtime.client_timeout_seconds,
    )));
    let (coordinator, events_rx) =
        SessionCoordinator::new(Arc::clone(&config), Arc::clone(&db), Arc::clone(&hub));
    coordinator.recover_orphaned_sessions().await?;

    if coordinator.supervisor().verify().await {
        info!(agent_cli = config.agent_cli, "agent binary verified");
    } else {
        warn!(
            agent_cli = config.agent_cli,
            "agent binary did not answer --version; sessions will fail to start until it is installed"
        );
    }

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let event_handle = coordinator.spawn_event_loop(events_rx, ct.clone());
    let sweep_handle = spawn_stream_sweeper(
        coordinator.streams(),
        Duration::from_secs(config.streaming.sweep_interval_seconds),
        ct.clone(),
    );
    let liveness_handle = spawn_liveness_sweep(
        Arc::clone(&hub),
        Duration::from_secs(config.realtime.heartbeat_interval_seconds),
        ct.clone(),
    );
    let idle_handle = coordinator.spawn_idle_cleanup(
        Duration::from_secs(config.idle.cleanup_interval_seconds),
        ct.clone(),
    );

    // ── Start HTTP ──────────────────────────────────────
    let bind = format!("{}:{}", config.http_host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;
    let http_ct = ct.clone();
    let state = AppState {
        coordinator: Arc::clone(&coordinator),
    };
    let http_handle = tokio::spawn(async move {
        if let Err(err) = http::serve(listener, state, http_ct).await {
            error!(%err, "http server failed");
        }
    });

    info!(%bind, "acp-orchestrator ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");

    coordinator.shutdown_all_sessions().await;
    hub.shutdown();
    ct.cancel();

    let _ = tokio::join!(
        http_handle,
        event_handle,
        sweep_handle,
        liveness_handle,
        idle_handle
    );
    info!("acp-orchestrator shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
