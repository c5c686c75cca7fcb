//! HTTP front-end.
//!
//! Terminates the control API and keeps the in-memory view of sessions.
//! The view is owned by [`ApiState`] and refreshed from the manager's
//! status stream in two places: a 100 ms background task, and at the top
//! of every handler — so each request sees the freshest state the manager
//! has published. The same background task enforces the heartbeat: when a
//! running session's deadline lapses, the front-end issues one
//! break-to-finished followed by one stop, and the session tears itself
//! down.

use axum::Router;
use axum::routing::{get, post};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::protocol::{Command, ManagerMessage, StatusEvent};
use crate::stage::Stage;

pub mod handlers;
pub mod session_id;

/// Artifact responses are chunked at this size, and larger files are
/// refused while a test still runs before `postprocess`.
pub const TRANSFER_SIZE_LIMIT: u64 = 128 * 1024;

/// Cadence of the background status drain / heartbeat check.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Mutable front-end state: the session view and the heartbeat clock.
#[derive(Debug)]
pub(crate) struct View {
    pub sessions: HashMap<String, StatusEvent>,
    pub running_id: Option<String>,
    pub hb_deadline: Option<Instant>,
    pub hb_timeout: Duration,
}

impl View {
    fn assimilate(&mut self, event: StatusEvent) {
        let session = event.session.clone();
        if event.status.is_terminal() {
            if self.running_id.as_deref() == Some(session.as_str()) {
                self.running_id = None;
                self.hb_deadline = None;
            }
        } else {
            self.running_id = Some(session.clone());
        }
        self.sessions.insert(session, event);
    }

    /// Push the heartbeat deadline out if `session` is the running one.
    pub fn touch(&mut self, session: &str) {
        if self.running_id.as_deref() == Some(session) {
            self.hb_deadline = Some(Instant::now() + self.hb_timeout);
        }
    }

    /// Install a freshly admitted session.
    pub fn admit(&mut self, session: &str, break_at: Stage, hb_timeout: Option<Duration>) {
        self.sessions
            .insert(session.to_string(), StatusEvent::starting(session, break_at));
        self.running_id = Some(session.to_string());
        if let Some(timeout) = hb_timeout {
            self.hb_timeout = timeout;
        }
        self.hb_deadline = Some(Instant::now() + self.hb_timeout);
    }
}

/// Shared state behind every handler.
pub struct ApiState {
    pub(crate) view: Mutex<View>,
    status_rx: Mutex<mpsc::Receiver<StatusEvent>>,
    cmd_tx: mpsc::Sender<ManagerMessage>,
    pub tests_dir: PathBuf,
}

impl ApiState {
    pub fn new(
        cfg: &ServerConfig,
        status_rx: mpsc::Receiver<StatusEvent>,
        cmd_tx: mpsc::Sender<ManagerMessage>,
    ) -> Self {
        Self {
            view: Mutex::new(View {
                sessions: HashMap::new(),
                running_id: None,
                hb_deadline: None,
                hb_timeout: cfg.heartbeat_timeout,
            }),
            status_rx: Mutex::new(status_rx),
            cmd_tx,
            tests_dir: cfg.tests_dir.clone(),
        }
    }

    /// Pull everything the manager has published into the view.
    pub async fn drain_status(&self) {
        let mut rx = self.status_rx.lock().await;
        let mut view = self.view.lock().await;
        while let Ok(event) = rx.try_recv() {
            view.assimilate(event);
        }
    }

    /// Send a command to the manager.
    pub async fn command(&self, cmd: Command) -> Result<(), ()> {
        self.cmd_tx.send(ManagerMessage::Command(cmd)).await.map_err(|_| ())
    }

    /// If the running session's heartbeat lapsed, return it and clear the
    /// deadline so the teardown fires exactly once.
    async fn take_expired_heartbeat(&self) -> Option<String> {
        let mut view = self.view.lock().await;
        let running = view.running_id.clone()?;
        let deadline = view.hb_deadline?;
        if Instant::now() > deadline {
            view.hb_deadline = None;
            Some(running)
        } else {
            None
        }
    }

    /// One background tick: refresh the view, then tear down an abandoned
    /// session (advance its break to `finished`, then stop it).
    pub async fn poll_tick(&self) {
        self.drain_status().await;
        if let Some(session) = self.take_expired_heartbeat().await {
            warn!(session, "heartbeat expired, tearing the session down");
            let run = Command::Run {
                session: session.clone(),
                break_at: Stage::Finished,
                config: None,
            };
            if self.command(run).await.is_err() {
                return;
            }
            let _ = self.command(Command::Stop { session }).await;
        }
    }
}

/// Build the router over shared state.
pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/run", post(handlers::run_post).get(handlers::run_get))
        .route("/stop", get(handlers::stop))
        .route("/status", get(handlers::status))
        .route("/artifact", get(handlers::artifact))
        .route("/upload", post(handlers::upload))
        .with_state(state)
}

/// Bind and serve until the process ends. Prints the bound address so
/// callers using an ephemeral port can discover it.
pub async fn serve(state: Arc<ApiState>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, "api front-end listening");
    println!("Listening on http://{addr}");

    let poller = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATUS_POLL_INTERVAL);
        loop {
            interval.tick().await;
            poller.poll_tick().await;
        }
    });

    let app = build_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_HEARTBEAT_TIMEOUT;
    use crate::protocol::SessionStatus;
    use tempfile::tempdir;

    pub(crate) struct TestBench {
        pub state: Arc<ApiState>,
        pub status_tx: mpsc::Sender<StatusEvent>,
        pub cmd_rx: mpsc::Receiver<ManagerMessage>,
        pub _tests_dir: tempfile::TempDir,
    }

    pub(crate) fn bench() -> TestBench {
        let tests_dir = tempdir().unwrap();
        let (status_tx, status_rx) = mpsc::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let cfg = ServerConfig::new(
            tests_dir.path().to_path_buf(),
            tests_dir.path().join("lock"),
            tests_dir.path().join("etc"),
            true,
            false,
            false,
            0,
            DEFAULT_HEARTBEAT_TIMEOUT,
        )
        .unwrap();
        cfg.ensure_directories().unwrap();
        let state = Arc::new(ApiState::new(&cfg, status_rx, cmd_tx));
        TestBench { state, status_tx, cmd_rx, _tests_dir: tests_dir }
    }

    fn running_event(session: &str, stage: Stage, break_at: Stage) -> StatusEvent {
        StatusEvent {
            session: session.to_string(),
            status: SessionStatus::Running,
            current_stage: Some(stage),
            stage_completed: Some(false),
            break_at: Some(break_at),
            failures: Some(Vec::new()),
            retcode: None,
            tank_status: Some("running".to_string()),
            reason: None,
        }
    }

    #[tokio::test]
    async fn assimilation_tracks_running_session() {
        let mut b = bench();
        b.status_tx.send(running_event("s1", Stage::Poll, Stage::Finished)).await.unwrap();
        b.state.drain_status().await;
        {
            let view = b.state.view.lock().await;
            assert_eq!(view.running_id.as_deref(), Some("s1"));
        }

        let mut done = running_event("s1", Stage::Finished, Stage::Finished);
        done.status = SessionStatus::Success;
        b.status_tx.send(done).await.unwrap();
        b.state.drain_status().await;
        {
            let view = b.state.view.lock().await;
            assert_eq!(view.running_id, None);
            assert_eq!(view.sessions["s1"].status, SessionStatus::Success);
        }
        assert!(b.cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_event_for_other_session_keeps_running_id() {
        let b = bench();
        {
            let mut view = b.state.view.lock().await;
            view.assimilate(running_event("live", Stage::Poll, Stage::Finished));
            view.assimilate(StatusEvent::synthesized("old", SessionStatus::Failed, "boom"));
        }
        let view = b.state.view.lock().await;
        assert_eq!(view.running_id.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn heartbeat_expiry_fires_run_then_stop_exactly_once() {
        let mut b = bench();
        {
            let mut view = b.state.view.lock().await;
            view.assimilate(running_event("s1", Stage::Poll, Stage::Finished));
            // Already lapsed.
            view.hb_deadline = Some(Instant::now() - Duration::from_secs(1));
        }

        b.state.poll_tick().await;

        match b.cmd_rx.try_recv().unwrap() {
            ManagerMessage::Command(Command::Run { session, break_at, config }) => {
                assert_eq!(session, "s1");
                assert_eq!(break_at, Stage::Finished);
                assert!(config.is_none());
            }
            other => panic!("expected run command, got {other:?}"),
        }
        match b.cmd_rx.try_recv().unwrap() {
            ManagerMessage::Command(Command::Stop { session }) => assert_eq!(session, "s1"),
            other => panic!("expected stop command, got {other:?}"),
        }

        // A second tick must not fire again.
        b.state.poll_tick().await;
        assert!(b.cmd_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn touch_defers_heartbeat_expiry() {
        let b = bench();
        {
            let mut view = b.state.view.lock().await;
            view.assimilate(running_event("s1", Stage::Poll, Stage::Finished));
            view.hb_deadline = Some(Instant::now() - Duration::from_secs(1));
            view.touch("s1");
        }
        assert!(b.state.take_expired_heartbeat().await.is_none());
    }
}
