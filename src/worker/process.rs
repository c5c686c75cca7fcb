//! Worker process entry point.
//!
//! The manager spawns this binary's hidden `worker` subcommand with the
//! session working directory as its current directory. Stdio is the IPC
//! surface: break commands arrive as JSON lines on stdin, status events
//! leave as JSON lines on stdout. All logging goes to per-session files in
//! the working directory — stdout must carry nothing but protocol.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::error;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::engine::SimEngine;
use crate::protocol::{BreakCommand, CHANNEL_CAPACITY, StatusEvent};
use crate::worker::{InterruptToken, Worker, WorkerEnv, install_signal_handlers};

/// Full engine log, DEBUG level.
pub const TANK_LOG: &str = "tank.log";
/// Condensed engine log, INFO level.
pub const TANK_BRIEF_LOG: &str = "tank_brief.log";

/// Arguments forwarded from the hidden `worker` subcommand.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub session_id: String,
    pub work_dir: PathBuf,
    pub lock_dir: PathBuf,
    /// Machine-level config directory; absent under
    /// `--ignore-machine-defaults`.
    pub configs_location: Option<PathBuf>,
}

/// Open the session log files and install them as the process subscriber.
/// The returned guards must stay alive until exit so buffered lines are
/// flushed.
fn init_logging(
    work_dir: &Path,
) -> Result<(tracing_appender::non_blocking::WorkerGuard, tracing_appender::non_blocking::WorkerGuard)>
{
    let (full, full_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(work_dir, TANK_LOG));
    let (brief, brief_guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(work_dir, TANK_BRIEF_LOG));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(full)
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(brief)
                .with_ansi(false)
                .with_filter(LevelFilter::INFO),
        )
        .try_init()
        .context("failed to install worker log subscriber")?;

    Ok((full_guard, brief_guard))
}

/// Run the worker until the pipeline reports its terminal status.
pub async fn run(args: WorkerArgs) -> Result<()> {
    let _log_guards = init_logging(&args.work_dir)?;

    let interrupt = InterruptToken::new();
    install_signal_handlers(interrupt.clone()).context("failed to install signal handlers")?;

    let (break_tx, break_rx) = mpsc::channel::<BreakCommand>(CHANNEL_CAPACITY);
    let (status_tx, mut status_rx) = mpsc::channel::<StatusEvent>(CHANNEL_CAPACITY);

    // Stdin → break channel. Dropping the sender on EOF tells the worker
    // the manager is gone.
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<BreakCommand>(&line) {
                        Ok(cmd) => {
                            if break_tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => error!(%err, line, "discarding unparseable break message"),
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "stdin read failed");
                    break;
                }
            }
        }
    });

    // Status channel → stdout, one JSON line per event.
    let emitter = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = status_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(mut line) => {
                    line.push('\n');
                    if stdout.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdout.flush().await;
                }
                Err(err) => error!(%err, "failed to encode status event"),
            }
        }
    });

    let engine = SimEngine::new(&args.work_dir);
    let env = WorkerEnv {
        session_id: args.session_id,
        work_dir: args.work_dir,
        lock_dir: args.lock_dir,
        machine_configs: args.configs_location,
    };
    Worker::new(engine, env, break_rx, status_tx, interrupt).run().await;

    // The worker dropped its sender; wait for the emitter to flush the
    // final status before exiting.
    emitter.await.context("status emitter failed")?;
    Ok(())
}
