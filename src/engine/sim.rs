//! Deterministic built-in engine.
//!
//! `SimEngine` implements the engine contract without generating any
//! traffic: each action sleeps for a configured duration and can be told to
//! fail at a chosen stage. It exists so the orchestrator is runnable and
//! testable end-to-end without a real generator linked in; sessions drive
//! it through the `sim:` mapping of their config, e.g.
//!
//! ```yaml
//! sim:
//!   poll_ms: 2000
//!   fail_at: prepare
//!   retcode: 0
//! ```

use async_trait::async_trait;
use fs2::FileExt;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::engine::{ActionResult, Engine};
use crate::errors::{EngineError, LockError};
use crate::stage::Stage;

/// File name of the global lock inside the lock directory.
pub const LOCK_FILE_NAME: &str = "tank.lock";

/// Behavior profile read from the `sim:` mapping of the merged configs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimProfile {
    pub configure_ms: u64,
    pub prepare_ms: u64,
    pub start_ms: u64,
    /// Duration of the simulated shooting, consumed by `wait_for_finish`.
    pub poll_ms: u64,
    pub end_ms: u64,
    pub postprocess_ms: u64,
    /// Stage whose engine action should fail, if any.
    pub fail_at: Option<Stage>,
    pub fail_reason: String,
    /// Return code reported by `wait_for_finish`.
    pub retcode: i32,
    pub wait_lock: bool,
    /// Files written to the working directory during `end`.
    pub artifacts: Vec<SimArtifact>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SimArtifact {
    pub name: String,
    pub contents: String,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            configure_ms: 0,
            prepare_ms: 0,
            start_ms: 0,
            poll_ms: 100,
            end_ms: 0,
            postprocess_ms: 0,
            fail_at: None,
            fail_reason: "injected failure".to_string(),
            retcode: 0,
            wait_lock: true,
            artifacts: Vec::new(),
        }
    }
}

impl SimProfile {
    /// Extract the profile from a config set, shallow-merging the `sim:`
    /// mappings of every document in order (later keys win).
    pub fn from_configs(configs: &[serde_yaml::Value]) -> Result<Self, EngineError> {
        let mut merged = serde_yaml::Mapping::new();
        for config in configs {
            if let Some(serde_yaml::Value::Mapping(sim)) = config.get("sim") {
                for (key, value) in sim {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        if merged.is_empty() {
            return Ok(SimProfile::default());
        }
        serde_yaml::from_value(serde_yaml::Value::Mapping(merged))
            .map_err(|err| EngineError::Config(format!("bad sim profile: {err}")))
    }
}

struct HeldLock {
    file: File,
    path: PathBuf,
}

/// The built-in engine. One instance drives one session and writes its
/// artifacts into that session's working directory.
pub struct SimEngine {
    profile: SimProfile,
    work_dir: PathBuf,
    status: String,
    artifacts: Vec<PathBuf>,
    lock: Option<HeldLock>,
}

impl SimEngine {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile: SimProfile::default(),
            work_dir: work_dir.into(),
            status: "not started".to_string(),
            artifacts: Vec::new(),
            lock: None,
        }
    }

    /// Files registered as artifacts so far.
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    fn maybe_fail(&self, stage: Stage) -> Result<(), EngineError> {
        if self.profile.fail_at == Some(stage) {
            return Err(EngineError::Other(self.profile.fail_reason.clone()));
        }
        Ok(())
    }

    async fn pace(&self, millis: u64) {
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
}

#[async_trait]
impl Engine for SimEngine {
    fn load_configs(&mut self, configs: Vec<serde_yaml::Value>) -> Result<(), EngineError> {
        self.profile = SimProfile::from_configs(&configs)?;
        debug!(profile = ?self.profile, "sim profile loaded");
        Ok(())
    }

    fn load_plugins(&mut self) -> Result<(), EngineError> {
        self.maybe_fail(Stage::Init)?;
        self.status = "initialized".to_string();
        Ok(())
    }

    async fn plugins_configure(&mut self) -> ActionResult {
        self.pace(self.profile.configure_ms).await;
        self.maybe_fail(Stage::Configure)?;
        self.status = "configured".to_string();
        Ok(None)
    }

    async fn plugins_prepare_test(&mut self) -> ActionResult {
        self.pace(self.profile.prepare_ms).await;
        self.maybe_fail(Stage::Prepare)?;
        self.status = "prepared".to_string();
        Ok(None)
    }

    async fn plugins_start_test(&mut self) -> ActionResult {
        self.pace(self.profile.start_ms).await;
        self.maybe_fail(Stage::Start)?;
        self.status = "running".to_string();
        Ok(None)
    }

    async fn wait_for_finish(&mut self) -> ActionResult {
        self.pace(self.profile.poll_ms).await;
        self.maybe_fail(Stage::Poll)?;
        self.status = "finished".to_string();
        Ok(Some(self.profile.retcode))
    }

    async fn plugins_end_test(&mut self, _retcode: Option<i32>) -> ActionResult {
        self.pace(self.profile.end_ms).await;
        for artifact in self.profile.artifacts.clone() {
            let path = self.work_dir.join(&artifact.name);
            std::fs::write(&path, &artifact.contents)?;
            self.add_artifact_file(&path);
        }
        self.maybe_fail(Stage::End)?;
        self.status = "ended".to_string();
        Ok(None)
    }

    async fn plugins_post_process(&mut self, _retcode: Option<i32>) -> ActionResult {
        self.pace(self.profile.postprocess_ms).await;
        self.maybe_fail(Stage::Postprocess)?;
        self.status = "post-processed".to_string();
        Ok(None)
    }

    fn try_lock(&mut self, lock_dir: &Path) -> Result<(), LockError> {
        let path = lock_dir.join(LOCK_FILE_NAME);
        let file = File::create(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!(lock = %path.display(), "acquired global lock");
                self.lock = Some(HeldLock { file, path });
                Ok(())
            }
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(LockError::Contended)
            }
            Err(err) => Err(LockError::Io(err)),
        }
    }

    fn wait_lock(&self) -> bool {
        self.profile.wait_lock
    }

    fn release_lock(&mut self) -> Result<(), EngineError> {
        if let Some(held) = self.lock.take() {
            FileExt::unlock(&held.file)?;
            // Best effort: another process may already be recreating it.
            let _ = std::fs::remove_file(&held.path);
            info!("released global lock");
        }
        Ok(())
    }

    fn add_artifact_file(&mut self, path: &Path) {
        self.artifacts.push(path.to_path_buf());
    }

    fn status(&self) -> String {
        self.status.clone()
    }
}
