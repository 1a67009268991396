//! # tether
//!
//! Drives a local coding agent for a remote operator. `run` speaks JSON
//! lines over stdio; `probe` and `sessions` are one-shot helpers.

#![deny(unsafe_code)]

mod stdio;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tether_backend::AgentBackend;
use tether_backend::factory::create_backend;
use tether_backend::server::ServerBackend;
use tether_core::logging::{init_json_subscriber, init_subscriber};
use tether_runtime::{
    InboundRouter, Orchestrator, OutboundBridge, ShutdownCoordinator, Transport, run_keep_alive,
};
use tether_settings::loader::parse_backend;
use tether_settings::{BackendKindSetting, TetherSettings, load_settings_from_path, settings_path};
use tokio::io::BufReader;
use tracing::{info, warn};

use crate::stdio::{StdioTransport, pump_inbound};

/// Session driver for local coding agents.
#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Session driver for local coding agents")]
struct Cli {
    /// Settings file (defaults to `~/.tether/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Backend override: `exec` or `server`.
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Log level override.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator over stdin/stdout (default).
    Run,
    /// Check that the configured backend is installed and reachable.
    Probe,
    /// Manage server-side sessions (server backend only).
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionsAction {
    /// List sessions as JSON lines.
    List,
    /// Delete one session.
    Delete {
        /// Session id.
        id: String,
    },
}

impl Cli {
    fn load_settings(&self) -> Result<TetherSettings> {
        let path = self.settings.clone().unwrap_or_else(settings_path);
        let mut settings = load_settings_from_path(&path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?;
        if let Some(backend) = &self.backend {
            let Some(kind) = parse_backend(backend) else {
                bail!("unknown backend {backend:?}, expected \"exec\" or \"server\"");
            };
            settings.backend = kind;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    if settings.logging.json {
        init_json_subscriber(&settings.logging.level);
    } else {
        init_subscriber(&settings.logging.level);
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Probe => probe(&settings).await,
        Command::Sessions { action } => sessions(&settings, action).await,
    }
}

async fn run(settings: TetherSettings) -> Result<()> {
    let backend = create_backend(&settings);
    let backend_info = match backend.probe().await {
        Ok(found) => found,
        Err(error) => {
            backend.dispose().await;
            return Err(error).context("agent backend is not available");
        }
    };
    info!(
        backend = %backend_info.kind,
        version = backend_info.version.as_deref().unwrap_or("unknown"),
        "agent backend available"
    );

    let coordinator = ShutdownCoordinator::new();
    let mut orchestrator = Orchestrator::new(backend, settings.orchestrator.clone())
        .with_shutdown(coordinator.token());
    let events = orchestrator.outbound();
    let (handle, dispatch) = orchestrator.spawn();

    let transport: Arc<dyn Transport> = Arc::new(StdioTransport::new(tokio::io::stdout()));
    let bridge = tokio::spawn(
        OutboundBridge::new(events, Arc::clone(&transport)).run(coordinator.token()),
    );
    let keep_alive = tokio::spawn(run_keep_alive(
        Arc::clone(&transport),
        handle.clone(),
        settings.orchestrator.keep_alive_interval(),
        coordinator.token(),
    ));

    let router = InboundRouter::new(handle, settings.defaults.to_mode());
    let token = coordinator.token();
    tokio::select! {
        () = pump_inbound(BufReader::new(tokio::io::stdin()), &router, &token) => {
            info!("stdin closed, shutting down");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(error) = signal {
                warn!(error = %error, "failed to listen for ctrl-c");
            }
            info!("interrupt received, shutting down");
        }
    }

    let clean = coordinator
        .graceful_shutdown(vec![dispatch, bridge, keep_alive], None)
        .await;
    if let Err(error) = transport.close().await {
        warn!(error = %error, "failed to close transport");
    }
    info!(clean, "shutdown complete");
    Ok(())
}

async fn probe(settings: &TetherSettings) -> Result<()> {
    let backend = create_backend(settings);
    let result = backend.probe().await;
    backend.dispose().await;
    let found = result.context("agent backend is not available")?;
    println!("{}", serde_json::to_string(&found)?);
    Ok(())
}

async fn sessions(settings: &TetherSettings, action: SessionsAction) -> Result<()> {
    if settings.backend != BackendKindSetting::Server {
        bail!("session management needs the server backend (use --backend server)");
    }
    let backend = ServerBackend::new(settings.server.clone(), settings.defaults.to_mode());
    let result = match action {
        SessionsAction::List => list_sessions(&backend).await,
        SessionsAction::Delete { id } => backend
            .delete_session(&id)
            .await
            .with_context(|| format!("failed to delete session {id}"))
            .map(|()| println!("deleted {id}")),
    };
    backend.dispose().await;
    result
}

async fn list_sessions(backend: &ServerBackend) -> Result<()> {
    let found = backend
        .list_sessions()
        .await
        .context("failed to list sessions")?;
    for session in found {
        println!("{}", serde_json::to_string(&session)?);
    }
    Ok(())
}
