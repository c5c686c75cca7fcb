//! Child-process handle for the worker.
//!
//! The manager re-executes this binary's hidden `worker` subcommand with
//! the session working directory as its current directory. Breaks are
//! written to the child's stdin as JSON lines; the child's stdout is read
//! line by line and each parsed status event is fed back into the
//! manager's queue. Stop requests are plain unix signals, so the worker
//! can convert them to its two interrupt levels.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::SpawnError;
use crate::protocol::{BreakCommand, ManagerMessage, StatusEvent};
use crate::stage::Stage;

/// File name the session config is written under in the working directory.
pub const SESSION_CONFIG_NAME: &str = "load.yaml";

/// What the runner needs to know to spawn a worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub tests_dir: PathBuf,
    pub lock_dir: PathBuf,
    /// Machine-level config directory; `None` skips machine defaults.
    pub configs_location: Option<PathBuf>,
    /// Override for the worker executable; defaults to the current binary.
    pub worker_exe: Option<PathBuf>,
}

/// A live (or recently exited) worker process.
pub struct WorkerRunner {
    child: Child,
    stdin: ChildStdin,
    pid: i32,
    exit_code: Option<i32>,
}

impl WorkerRunner {
    /// Set up the session working directory and start the worker with its
    /// initial break already queued.
    pub async fn spawn(
        spec: &SpawnSpec,
        session_id: &str,
        config: &[u8],
        first_break: Stage,
        status_tx: mpsc::Sender<ManagerMessage>,
    ) -> Result<Self, SpawnError> {
        let work_dir = spec.tests_dir.join(session_id);
        std::fs::create_dir_all(&work_dir)
            .map_err(|source| SpawnError::WorkDir { path: work_dir.clone(), source })?;
        std::fs::write(work_dir.join(SESSION_CONFIG_NAME), config)
            .map_err(SpawnError::Config)?;

        let exe = match &spec.worker_exe {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(SpawnError::Executable)?,
        };

        let mut command = Command::new(exe);
        command
            .arg("worker")
            .arg("--session")
            .arg(session_id)
            .arg("--work-dir")
            .arg(&work_dir)
            .arg("--lock-dir")
            .arg(&spec.lock_dir)
            .current_dir(&work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(configs) = &spec.configs_location {
            command.arg("--configs-location").arg(configs);
        }

        let mut child = command.spawn().map_err(SpawnError::Process)?;
        let stdin = child.stdin.take().ok_or(SpawnError::Handle("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::Handle("stdout"))?;
        let pid = child.id().ok_or(SpawnError::Handle("pid"))? as i32;
        info!(session = session_id, pid, "worker spawned");

        // Child stdout → manager queue. Ends when the child exits or the
        // manager goes away.
        let session = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<StatusEvent>(&line) {
                    Ok(event) => {
                        debug!(session, status = ?event.status, "worker status");
                        if status_tx.send(ManagerMessage::Status(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => error!(%err, line, "discarding unparseable worker status"),
                }
            }
        });

        let mut runner = Self { child, stdin, pid, exit_code: None };
        runner.set_break(first_break).await.map_err(SpawnError::FirstBreak)?;
        Ok(runner)
    }

    /// Send the next break to the worker.
    pub async fn set_break(&mut self, break_at: Stage) -> io::Result<()> {
        let mut line = serde_json::to_string(&BreakCommand { break_at })?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }

    /// Whether the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        self.poll_exit().is_none()
    }

    /// Exit code if the worker has exited. Signal deaths map to the
    /// negated signal number so the death report always has a value.
    pub fn poll_exit(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = Some(exit_code_of(status));
                self.exit_code
            }
            Ok(None) => None,
            Err(err) => {
                warn!(%err, "failed to poll worker exit status");
                None
            }
        }
    }

    /// Wait for the worker to exit and return its code.
    pub async fn wait(&mut self) -> Option<i32> {
        if self.exit_code.is_some() {
            return self.exit_code;
        }
        match self.child.wait().await {
            Ok(status) => {
                self.exit_code = Some(exit_code_of(status));
                self.exit_code
            }
            Err(err) => {
                warn!(%err, "failed to wait for worker exit");
                None
            }
        }
    }

    /// Soft stop: SIGINT, the worker keeps its break so teardown runs.
    pub fn stop(&mut self) {
        self.signal(Signal::SIGINT);
    }

    /// Hard stop: SIGTERM, the worker removes its break and tears down.
    pub fn terminate(&mut self) {
        self.signal(Signal::SIGTERM);
    }

    fn signal(&mut self, signal: Signal) {
        if !self.is_alive() {
            return;
        }
        if let Err(err) = kill(Pid::from_raw(self.pid), signal) {
            warn!(pid = self.pid, %err, "failed to signal worker");
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| -sig)).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_prefers_plain_code() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(0x0100); // exited 1
        assert_eq!(exit_code_of(status), 1);
    }

    #[test]
    fn exit_code_maps_signals_negative() {
        use std::os::unix::process::ExitStatusExt;
        let status = std::process::ExitStatus::from_raw(15); // killed by SIGTERM
        assert_eq!(exit_code_of(status), -15);
    }
}
