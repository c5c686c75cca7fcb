//! Runtime configuration for the serve process.
//!
//! Bridges CLI arguments to the runtime needs of the manager and the HTTP
//! front-end: where session working directories live, where the engine's
//! global lock is kept, and the knobs that shape the actors' loops.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Default heartbeat timeout before an abandoned session is torn down.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(600);

/// How often the manager wakes from its queue to check worker liveness.
pub const WORKER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root under which per-session working directories are created
    /// (`{work_dir}/tests/{session_id}`).
    pub tests_dir: PathBuf,
    /// Directory holding the engine's global lock file.
    pub lock_dir: PathBuf,
    /// Machine-level engine config directory.
    pub configs_location: PathBuf,
    /// Skip machine-level configs when assembling the engine config set.
    pub ignore_machine_defaults: bool,
    /// One-shot mode: shut down after the first session terminates.
    pub disposable: bool,
    pub debug: bool,
    /// Port for the HTTP front-end; 0 binds an ephemeral port.
    pub port: u16,
    pub heartbeat_timeout: Duration,
}

impl ServerConfig {
    pub fn new(
        work_dir: PathBuf,
        lock_dir: PathBuf,
        configs_location: PathBuf,
        ignore_machine_defaults: bool,
        disposable: bool,
        debug: bool,
        port: u16,
        heartbeat_timeout: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("failed to create work dir {}", work_dir.display()))?;
        let work_dir = work_dir
            .canonicalize()
            .context("failed to resolve work dir")?;

        Ok(Self {
            tests_dir: work_dir.join("tests"),
            lock_dir,
            configs_location,
            ignore_machine_defaults,
            disposable,
            debug,
            port,
            heartbeat_timeout,
        })
    }

    /// Create the directories the actors assume to exist.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.tests_dir).context("failed to create tests directory")?;
        std::fs::create_dir_all(&self.lock_dir).context("failed to create lock directory")?;
        Ok(())
    }

    /// Working directory for one session.
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.tests_dir.join(session_id)
    }
}
