use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use tankd::api;
use tankd::config::ServerConfig;
use tankd::manager::{Manager, ManagerConfig, SpawnSpec};
use tankd::protocol::CHANNEL_CAPACITY;
use tankd::worker::process::{self, WorkerArgs};

#[derive(Parser)]
#[command(name = "tankd")]
#[command(version, about = "HTTP control plane for a load-testing engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator: HTTP front-end plus session manager.
    Serve {
        /// Root directory; session working directories live under
        /// `{work_dir}/tests`.
        #[arg(long, default_value = "/var/lib/tankd")]
        work_dir: PathBuf,

        /// Directory holding the engine's global lock file.
        #[arg(long, default_value = "/var/lock")]
        lock_dir: PathBuf,

        /// Machine-level engine config directory.
        #[arg(long, default_value = "/etc/tankd")]
        configs_location: PathBuf,

        /// Skip machine-level configs when assembling session configs.
        #[arg(long)]
        ignore_machine_defaults: bool,

        /// One-shot mode: exit after the first session terminates.
        #[arg(long)]
        disposable: bool,

        /// Verbose logging.
        #[arg(long)]
        debug: bool,

        /// Port for the HTTP API; 0 binds an ephemeral port.
        #[arg(long, default_value_t = 8888)]
        port: u16,

        /// Default heartbeat timeout in seconds before an abandoned
        /// session is torn down.
        #[arg(long, default_value_t = 600)]
        heartbeat: u64,

        /// Append logs to this file instead of stderr.
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Worker child process. Spawned by the manager, not for operators.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        session: String,

        #[arg(long)]
        work_dir: PathBuf,

        #[arg(long)]
        lock_dir: PathBuf,

        #[arg(long)]
        configs_location: Option<PathBuf>,
    },
}

fn init_logging(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" }));
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Wire the manager and the front-end together and serve until one of
/// them ends: the manager returning means disposable shutdown (or a dead
/// front-end), the server returning means the listener failed.
async fn run_server(cfg: ServerConfig) -> Result<()> {
    let (manager_tx, manager_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (webserver_tx, webserver_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let manager_cfg = ManagerConfig {
        spawn: SpawnSpec {
            tests_dir: cfg.tests_dir.clone(),
            lock_dir: cfg.lock_dir.clone(),
            configs_location: (!cfg.ignore_machine_defaults)
                .then(|| cfg.configs_location.clone()),
            worker_exe: None,
        },
        disposable: cfg.disposable,
    };
    let manager = Manager::new(manager_cfg, manager_rx, manager_tx.clone(), webserver_tx);
    let mut manager_task = tokio::spawn(manager.run());

    let state = Arc::new(api::ApiState::new(&cfg, webserver_rx, manager_tx));
    let port = cfg.port;

    tokio::select! {
        result = api::serve(state, port) => result,
        joined = &mut manager_task => {
            info!("manager exited, shutting down");
            joined.context("manager task panicked")?;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            work_dir,
            lock_dir,
            configs_location,
            ignore_machine_defaults,
            disposable,
            debug,
            port,
            heartbeat,
            log_file,
        } => {
            init_logging(debug, log_file.as_deref())?;
            let cfg = ServerConfig::new(
                work_dir,
                lock_dir,
                configs_location,
                ignore_machine_defaults,
                disposable,
                debug,
                port,
                Duration::from_secs(heartbeat),
            )?;
            cfg.ensure_directories()?;
            info!("starting server");
            run_server(cfg).await
        }
        Commands::Worker { session, work_dir, lock_dir, configs_location } => {
            process::run(WorkerArgs {
                session_id: session,
                work_dir,
                lock_dir,
                configs_location,
            })
            .await
        }
    }
}
