//! The manager: single source of truth for which session is running.
//!
//! A single-threaded event loop that multiplexes commands from the
//! front-end with status events streamed back from the worker. It admits
//! one worker at a time, relays break advances, converts stop requests to
//! signals, and watches both of its neighbors: a dead worker is turned
//! into a synthesized `failed` status, a dead front-end tears the worker
//! down and ends the process. Protocol violations are logged and dropped,
//! never fatal.

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::WORKER_CHECK_INTERVAL;
use crate::protocol::{Command, ManagerMessage, SessionStatus, StatusEvent};

pub mod runner;

pub use runner::{SpawnSpec, WorkerRunner};

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub spawn: SpawnSpec,
    /// One-shot mode: shut down after the first session terminates.
    pub disposable: bool,
}

pub struct Manager {
    cfg: ManagerConfig,
    rx: mpsc::Receiver<ManagerMessage>,
    /// Handed to worker stdout readers so their statuses land in `rx`.
    self_tx: mpsc::Sender<ManagerMessage>,
    webserver_tx: mpsc::Sender<StatusEvent>,
    session_id: Option<String>,
    runner: Option<WorkerRunner>,
    last_status: Option<SessionStatus>,
    shutdown: bool,
}

impl Manager {
    pub fn new(
        cfg: ManagerConfig,
        rx: mpsc::Receiver<ManagerMessage>,
        self_tx: mpsc::Sender<ManagerMessage>,
        webserver_tx: mpsc::Sender<StatusEvent>,
    ) -> Self {
        Self {
            cfg,
            rx,
            self_tx,
            webserver_tx,
            session_id: None,
            runner: None,
            last_status: None,
            shutdown: false,
        }
    }

    /// Event loop. Returns when the front-end disappears or, in disposable
    /// mode, after the first session terminates.
    pub async fn run(mut self) {
        // After worker death, drain the queue for one more tick before
        // reporting, so trailing status lines are not lost.
        let mut handle_worker_exit = false;

        loop {
            match tokio::time::timeout(WORKER_CHECK_INTERVAL, self.rx.recv()).await {
                Ok(Some(msg)) => self.handle_message(msg).await,
                Ok(None) => {
                    // Unreachable while self_tx is held, but don't spin.
                    error!("manager queue closed");
                    return;
                }
                Err(_) => {
                    if handle_worker_exit {
                        self.finalize_worker_exit().await;
                        handle_worker_exit = false;
                    } else if self.worker_died() {
                        handle_worker_exit = true;
                    } else if self.webserver_tx.is_closed() {
                        self.teardown_for_frontend_death().await;
                        return;
                    }
                }
            }
            if self.shutdown {
                info!("disposable session finished, shutting down");
                return;
            }
        }
    }

    async fn handle_message(&mut self, msg: ManagerMessage) {
        match msg {
            ManagerMessage::Command(cmd) => self.handle_command(cmd).await,
            ManagerMessage::Status(event) => self.handle_worker_status(event).await,
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Run { session, break_at, config } => {
                if let Some(active) = self.session_id.clone() {
                    if session == active {
                        if let Some(runner) = &mut self.runner {
                            if let Err(err) = runner.set_break(break_at).await {
                                warn!(%err, "failed to forward break to worker");
                            }
                        }
                    } else {
                        // The front-end must not admit a second session.
                        error!(
                            session,
                            active, "run command for another session while one is running"
                        );
                    }
                } else {
                    self.start_session(session, break_at, config).await;
                }
            }
            Command::Stop { session } => {
                if self.session_id.as_deref() == Some(session.as_str()) {
                    if let Some(runner) = &mut self.runner {
                        info!(session, "stopping worker");
                        runner.stop();
                    }
                } else {
                    error!(session, "can stop only the current session");
                }
            }
        }
    }

    async fn start_session(&mut self, session: String, break_at: crate::stage::Stage, config: Option<Vec<u8>>) {
        let Some(config) = config else {
            error!(session, "run command without config for a new session");
            return;
        };
        match WorkerRunner::spawn(
            &self.cfg.spawn,
            &session,
            &config,
            break_at,
            self.self_tx.clone(),
        )
        .await
        {
            Ok(runner) => {
                self.runner = Some(runner);
                self.session_id = Some(session);
                self.last_status = None;
            }
            Err(err) => {
                warn!(session, %err, "failed to start worker");
                let mut event = StatusEvent::synthesized(
                    &session,
                    SessionStatus::Failed,
                    format!("Failed to start tank: {err}"),
                );
                event.break_at = Some(break_at);
                self.forward(event).await;
            }
        }
    }

    /// Remember the new status, reap the worker on graceful completion,
    /// and relay to the front-end.
    async fn handle_worker_status(&mut self, event: StatusEvent) {
        let was_terminal = self.last_status.is_some_and(SessionStatus::is_terminal);
        let now_terminal = event.status.is_terminal();
        self.last_status = Some(event.status);

        if !was_terminal && now_terminal {
            info!("waiting for worker exit");
            if let Some(runner) = &mut self.runner {
                runner.wait().await;
            }
            self.reset_session();
        }
        self.forward(event).await;
    }

    fn worker_died(&mut self) -> bool {
        self.session_id.is_some()
            && self.runner.as_mut().is_none_or(|runner| !runner.is_alive())
    }

    /// The queue has been drained since death was noticed; report it if it
    /// was unexpected and free the session slot.
    async fn finalize_worker_exit(&mut self) {
        let exit_code = match &mut self.runner {
            Some(runner) => runner.wait().await,
            None => None,
        };
        let unexpected =
            self.last_status == Some(SessionStatus::Running) || exit_code != Some(0);
        if unexpected {
            if let Some(session) = self.session_id.clone() {
                let reason = death_reason(self.last_status, exit_code);
                warn!(session, reason, "worker died unexpectedly");
                self.forward(StatusEvent::synthesized(&session, SessionStatus::Failed, reason))
                    .await;
            }
        }
        self.reset_session();
    }

    async fn teardown_for_frontend_death(&mut self) {
        error!("webserver died unexpectedly");
        if let Some(runner) = &mut self.runner {
            warn!("terminating worker");
            runner.terminate();
            runner.wait().await;
        }
        self.reset_session();
    }

    async fn forward(&mut self, event: StatusEvent) {
        if self.webserver_tx.send(event).await.is_err() {
            // The next idle tick notices the dead front-end.
            warn!("status update dropped, webserver queue closed");
        }
    }

    fn reset_session(&mut self) {
        info!("resetting current session variables");
        self.session_id = None;
        self.runner = None;
        self.last_status = None;
        if self.cfg.disposable {
            self.shutdown = true;
        }
    }
}

/// Reason text for an unexpected worker death.
fn death_reason(last_status: Option<SessionStatus>, exit_code: Option<i32>) -> String {
    let last = last_status.map_or("not started".to_string(), |status| status.to_string());
    let code = exit_code.map_or("unknown".to_string(), |code| code.to_string());
    format!("Tank died unexpectedly. Last reported status: {last}, worker exitcode: {code}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Stage;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    struct TestBench {
        manager_tx: mpsc::Sender<ManagerMessage>,
        webserver_rx: mpsc::Receiver<StatusEvent>,
        handle: tokio::task::JoinHandle<()>,
    }

    /// Manager wired to channels, with a worker exe that cannot spawn so
    /// admission failures are observable.
    fn bench(tests_dir: PathBuf, disposable: bool) -> TestBench {
        let (manager_tx, manager_rx) = mpsc::channel(16);
        let (webserver_tx, webserver_rx) = mpsc::channel(16);
        let cfg = ManagerConfig {
            spawn: SpawnSpec {
                tests_dir: tests_dir.clone(),
                lock_dir: tests_dir,
                configs_location: None,
                worker_exe: Some(PathBuf::from("/nonexistent/tankd-worker")),
            },
            disposable,
        };
        let manager = Manager::new(cfg, manager_rx, manager_tx.clone(), webserver_tx);
        TestBench { manager_tx, webserver_rx, handle: tokio::spawn(manager.run()) }
    }

    #[test]
    fn death_reason_names_status_and_exitcode() {
        assert_eq!(
            death_reason(Some(SessionStatus::Running), Some(-9)),
            "Tank died unexpectedly. Last reported status: running, worker exitcode: -9"
        );
        assert_eq!(
            death_reason(None, None),
            "Tank died unexpectedly. Last reported status: not started, worker exitcode: unknown"
        );
    }

    #[tokio::test]
    async fn spawn_failure_synthesizes_failed_status() {
        let dir = tempdir().unwrap();
        let mut b = bench(dir.path().to_path_buf(), false);

        b.manager_tx
            .send(ManagerMessage::Command(Command::Run {
                session: "s1".to_string(),
                break_at: Stage::Finished,
                config: Some(b"test: 1".to_vec()),
            }))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), b.webserver_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.session, "s1");
        assert_eq!(event.status, SessionStatus::Failed);
        assert!(event.reason.unwrap().starts_with("Failed to start tank:"));
        assert_eq!(event.break_at, Some(Stage::Finished));

        // The config still landed on disk before the spawn attempt.
        let written = std::fs::read(dir.path().join("s1").join("load.yaml")).unwrap();
        assert_eq!(written, b"test: 1");
        b.handle.abort();
    }

    #[tokio::test]
    async fn stop_for_unknown_session_is_ignored() {
        let dir = tempdir().unwrap();
        let mut b = bench(dir.path().to_path_buf(), false);

        b.manager_tx
            .send(ManagerMessage::Command(Command::Stop { session: "ghost".to_string() }))
            .await
            .unwrap();

        // Nothing must come back and the manager must stay alive.
        let outcome =
            tokio::time::timeout(Duration::from_millis(300), b.webserver_rx.recv()).await;
        assert!(outcome.is_err(), "unexpected status event for ignored stop");
        assert!(!b.handle.is_finished());
        b.handle.abort();
    }

    #[tokio::test]
    async fn run_without_config_for_new_session_is_dropped() {
        let dir = tempdir().unwrap();
        let mut b = bench(dir.path().to_path_buf(), false);

        b.manager_tx
            .send(ManagerMessage::Command(Command::Run {
                session: "s1".to_string(),
                break_at: Stage::Finished,
                config: None,
            }))
            .await
            .unwrap();

        let outcome =
            tokio::time::timeout(Duration::from_millis(300), b.webserver_rx.recv()).await;
        assert!(outcome.is_err(), "protocol violation must not produce status");
        assert!(!b.handle.is_finished());
        b.handle.abort();
    }

    #[tokio::test]
    async fn terminal_status_resets_session_and_forwards() {
        let dir = tempdir().unwrap();
        let mut b = bench(dir.path().to_path_buf(), false);

        // A success status for a session the manager never admitted only
        // exercises the forwarding path; with no runner the reset is a
        // no-op, but the event must still reach the front-end.
        let event = StatusEvent::synthesized("s1", SessionStatus::Success, "done");
        b.manager_tx.send(ManagerMessage::Status(event.clone())).await.unwrap();

        let forwarded = tokio::time::timeout(Duration::from_secs(5), b.webserver_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded, event);
        b.handle.abort();
    }

    #[tokio::test]
    async fn disposable_manager_exits_after_session_reset() {
        let dir = tempdir().unwrap();
        let mut b = bench(dir.path().to_path_buf(), true);

        b.manager_tx
            .send(ManagerMessage::Status(StatusEvent::synthesized(
                "s1",
                SessionStatus::Failed,
                "boom",
            )))
            .await
            .unwrap();

        let forwarded = tokio::time::timeout(Duration::from_secs(5), b.webserver_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(forwarded.status, SessionStatus::Failed);

        tokio::time::timeout(Duration::from_secs(5), b.handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn frontend_death_ends_the_manager() {
        let dir = tempdir().unwrap();
        let b = bench(dir.path().to_path_buf(), false);

        drop(b.webserver_rx);
        // Detected on an idle tick of the liveness check.
        tokio::time::timeout(Duration::from_secs(5), b.handle).await.unwrap().unwrap();
    }
}
