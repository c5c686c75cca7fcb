//! Typed error hierarchy for the orchestrator.
//!
//! Four enums cover the fault boundaries:
//! - `EngineError` — failures raised by engine actions
//! - `LockError` — global lock acquisition outcomes
//! - `StageError` — everything a single stage execution attempt can produce
//! - `SpawnError` — why a worker process failed to come up
//!
//! Stage failures are recovered inside the worker (recorded, never aborting
//! the run); spawn failures become a synthesized `failed` status in the
//! manager; client-facing errors are mapped to HTTP responses in the API
//! layer and never reach these types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by engine actions.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Outcome of a single global-lock acquisition attempt.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another test holds the lock file; retry may succeed.
    #[error("lock file is held by another test")]
    Contended,

    #[error("failed to access lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// What executing one stage can produce besides success.
#[derive(Debug, Error)]
pub enum StageError {
    /// Cooperative cancellation. `remove_break` distinguishes the hard
    /// variant, which also forces the break to `finished` so teardown runs
    /// without further waits.
    #[error("Interrupted")]
    Interrupted { remove_break: bool },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("could not acquire lock: {0}")]
    Lock(#[from] LockError),
}

/// Why the manager could not bring a worker process up.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to create working directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write session config: {0}")]
    Config(#[source] std::io::Error),

    #[error("failed to locate own executable: {0}")]
    Executable(#[source] std::io::Error),

    #[error("failed to spawn worker process: {0}")]
    Process(#[source] std::io::Error),

    /// A pipe or pid handle the runner needs was not available on the
    /// freshly spawned child.
    #[error("worker {0} unavailable")]
    Handle(&'static str),

    #[error("failed to send initial break to worker: {0}")]
    FirstBreak(#[source] std::io::Error),
}
