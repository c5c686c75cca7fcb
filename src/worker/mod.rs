//! The worker: drives one engine instance through the stage pipeline.
//!
//! Runs as an isolated child process (see [`process`]) so a crashing engine
//! cannot take down the front-end. The stage loop executes every
//! non-terminal stage in canonical order, parking at the configured break
//! until the manager advances it, and publishes a status event on every
//! state transition. Stage failures are recorded and never abort the run;
//! the dependency table decides which later stages are skipped, and the
//! teardown stages depend only on `lock`, so cleanup runs whenever locking
//! succeeded.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::engine::{Engine, configs};
use crate::errors::{LockError, StageError};
use crate::protocol::{BreakCommand, Failure, SessionStatus, StatusEvent};
use crate::stage::Stage;

pub mod interrupt;
pub mod process;

pub use interrupt::{InterruptLevel, InterruptToken, install_signal_handlers};

/// Back-off between attempts on a contended global lock.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Per-session inputs handed to the worker by the manager.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub session_id: String,
    pub work_dir: PathBuf,
    pub lock_dir: PathBuf,
    /// Machine-level config directory; `None` ignores machine defaults.
    pub machine_configs: Option<PathBuf>,
}

enum Parked {
    Break(Option<BreakCommand>),
    Interrupted(InterruptLevel),
}

/// Sequences one engine through the pipeline.
pub struct Worker<E: Engine> {
    engine: E,
    env: WorkerEnv,
    breaks: mpsc::Receiver<BreakCommand>,
    status_tx: mpsc::Sender<StatusEvent>,
    interrupt: InterruptToken,
    break_at: Stage,
    stage: Stage,
    failures: Vec<Failure>,
    retcode: Option<i32>,
    done: HashSet<Stage>,
    locked: bool,
}

impl<E: Engine> Worker<E> {
    pub fn new(
        engine: E,
        env: WorkerEnv,
        breaks: mpsc::Receiver<BreakCommand>,
        status_tx: mpsc::Sender<StatusEvent>,
        interrupt: InterruptToken,
    ) -> Self {
        Self {
            engine,
            env,
            breaks,
            status_tx,
            interrupt,
            // The first break always arrives over the channel before the
            // pipeline can pass `lock`.
            break_at: Stage::Lock,
            stage: Stage::Init,
            failures: Vec::new(),
            retcode: None,
            done: HashSet::new(),
            locked: false,
        }
    }

    /// Run the full pipeline, consuming the worker. The final status event
    /// is `failed` if any stage recorded a failure, `success` otherwise.
    pub async fn run(mut self) {
        for stage in Stage::executable() {
            self.next_stage(stage).await;
        }
        self.stage = Stage::Finished;
        let status = if self.failures.is_empty() {
            SessionStatus::Success
        } else {
            SessionStatus::Failed
        };
        self.report_status(status, true).await;
        info!(retcode = ?self.retcode, "done performing test");
    }

    /// Park until allowed past `stage`, then execute or skip it, reporting
    /// status around the attempt.
    async fn next_stage(&mut self, stage: Stage) {
        while !stage.is_earlier(self.break_at) {
            self.park_at_break().await;
        }
        self.stage = stage;
        self.report_status(SessionStatus::Running, false).await;

        let dependency_met = stage
            .predecessor()
            .is_none_or(|dep| self.done.contains(&dep));
        if dependency_met {
            match self.execute_stage(stage).await {
                Ok(()) => {
                    self.done.insert(stage);
                }
                Err(StageError::Interrupted { remove_break }) => {
                    self.retcode.get_or_insert(1);
                    self.process_failure("Interrupted");
                    if remove_break {
                        self.break_at = Stage::Finished;
                    }
                }
                Err(err) => {
                    self.retcode.get_or_insert(1);
                    self.process_failure(&err.to_string());
                }
            }
        } else {
            self.process_failure("skipped");
        }

        self.report_status(SessionStatus::Running, true).await;
    }

    /// Wait at the current break for a command that moves it forward.
    ///
    /// An interrupt, or a closed break channel (the manager is gone),
    /// unparks into teardown: the break is removed and the interrupt is
    /// left pending so the next stage attempt fails at its call boundary
    /// with reason "Interrupted", while the cleanup stages still run.
    async fn park_at_break(&mut self) {
        let parked = {
            let interrupt = self.interrupt.clone();
            tokio::select! {
                msg = self.breaks.recv() => Parked::Break(msg),
                level = interrupt.raised() => Parked::Interrupted(level),
            }
        };
        match parked {
            Parked::Break(Some(msg)) => {
                if msg.break_at.is_earlier(self.break_at) {
                    error!(
                        requested = %msg.break_at,
                        current = %self.break_at,
                        "received break earlier than current next break, ignoring"
                    );
                } else {
                    info!(from = %self.break_at, to = %msg.break_at, "changing next break");
                    self.break_at = msg.break_at;
                }
            }
            Parked::Break(None) => {
                warn!("break channel closed while parked, tearing down");
                self.break_at = Stage::Finished;
                self.interrupt.raise(InterruptLevel::Hard);
            }
            Parked::Interrupted(level) => {
                warn!(?level, "interrupted while parked at break");
                self.break_at = Stage::Finished;
                self.interrupt.raise(level);
            }
        }
    }

    async fn execute_stage(&mut self, stage: Stage) -> Result<(), StageError> {
        let new_retcode = match stage {
            Stage::Init => {
                self.init_engine()?;
                None
            }
            Stage::Lock => {
                self.acquire_lock().await?;
                self.locked = true;
                None
            }
            Stage::Unlock => {
                self.engine.release_lock()?;
                self.locked = false;
                None
            }
            Stage::Configure
            | Stage::Prepare
            | Stage::Start
            | Stage::Poll
            | Stage::End
            | Stage::Postprocess => self.engine_call(stage).await?,
            Stage::Finished => None,
        };
        if new_retcode.is_some() {
            self.retcode = new_retcode;
        }
        Ok(())
    }

    /// Load configs and plugins, and register the session log files the
    /// process shell opened as artifacts.
    fn init_engine(&mut self) -> Result<(), StageError> {
        let configs = configs::collect(self.env.machine_configs.as_deref(), &self.env.work_dir);
        self.engine.load_configs(configs)?;
        self.engine.load_plugins()?;
        for log_name in [process::TANK_LOG, process::TANK_BRIEF_LOG] {
            let path = self.env.work_dir.join(log_name);
            self.engine.add_artifact_file(&path);
        }
        Ok(())
    }

    /// One engine action, raced against the cancellation token so a signal
    /// lands at the call boundary even mid `wait_for_finish`.
    async fn engine_call(&mut self, stage: Stage) -> Result<Option<i32>, StageError> {
        if let Some(level) = self.interrupt.take() {
            return Err(StageError::Interrupted { remove_break: level.removes_break() });
        }
        let interrupt = self.interrupt.clone();
        let retcode = self.retcode;
        let engine = &mut self.engine;
        let action = async move {
            match stage {
                Stage::Configure => engine.plugins_configure().await,
                Stage::Prepare => engine.plugins_prepare_test().await,
                Stage::Start => engine.plugins_start_test().await,
                Stage::Poll => engine.wait_for_finish().await,
                Stage::End => engine.plugins_end_test(retcode).await,
                Stage::Postprocess => engine.plugins_post_process(retcode).await,
                _ => Ok(None),
            }
        };
        tokio::select! {
            biased;
            level = interrupt.raised() => {
                Err(StageError::Interrupted { remove_break: level.removes_break() })
            }
            result = action => result.map_err(StageError::from),
        }
    }

    /// Acquire the global lock, backing off on contention while the engine
    /// permits waiting.
    async fn acquire_lock(&mut self) -> Result<(), StageError> {
        loop {
            if let Some(level) = self.interrupt.take() {
                return Err(StageError::Interrupted { remove_break: level.removes_break() });
            }
            match self.engine.try_lock(&self.env.lock_dir) {
                Ok(()) => return Ok(()),
                Err(LockError::Contended) if self.engine.wait_lock() => {
                    warn!("couldn't get lock, will retry in {:?}", LOCK_RETRY_INTERVAL);
                    let interrupt = self.interrupt.clone();
                    let interrupted = tokio::select! {
                        level = interrupt.raised() => Some(level),
                        _ = tokio::time::sleep(LOCK_RETRY_INTERVAL) => None,
                    };
                    if let Some(level) = interrupted {
                        return Err(StageError::Interrupted { remove_break: level.removes_break() });
                    }
                }
                Err(err) => return Err(StageError::Lock(err)),
            }
        }
    }

    fn process_failure(&mut self, reason: &str) {
        error!(stage = %self.stage, reason, "failure in stage");
        self.failures.push(Failure { stage: self.stage, reason: reason.to_string() });
    }

    /// Publish the current state, and mirror it to `status.json` once the
    /// lock is held.
    async fn report_status(&mut self, status: SessionStatus, stage_completed: bool) {
        let shaped = if self.break_at == Stage::Start
            && self.stage == Stage::Prepare
            && stage_completed
            && !status.is_terminal()
        {
            SessionStatus::Prepared
        } else {
            status
        };
        let event = StatusEvent {
            session: self.env.session_id.clone(),
            status: shaped,
            current_stage: Some(self.stage),
            stage_completed: Some(stage_completed),
            break_at: Some(self.break_at),
            failures: Some(self.failures.clone()),
            retcode: self.retcode,
            tank_status: Some(self.engine.status()),
            reason: None,
        };
        if self.status_tx.send(event.clone()).await.is_err() {
            // The manager is gone; keep running so teardown still happens.
            warn!("status channel closed, continuing without reporting");
        }
        if self.locked {
            if let Err(err) = self.dump_status(&event) {
                warn!(%err, "failed to write status.json");
            }
        }
    }

    /// Atomic write: temp file in the working directory, then rename.
    fn dump_status(&self, event: &StatusEvent) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(event)?;
        let target = self.env.work_dir.join("status.json");
        let staging = self.env.work_dir.join("status.json.tmp");
        std::fs::write(&staging, body)?;
        std::fs::rename(&staging, target)
    }
}
