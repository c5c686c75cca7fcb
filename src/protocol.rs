//! Inter-actor message protocol.
//!
//! Three logical queues connect the actors:
//!
//! | Queue          | Producers            | Consumer  | Payload |
//! |----------------|----------------------|-----------|---------|
//! | `manager_in`   | front-end, worker    | manager   | [`ManagerMessage`] |
//! | `webserver_in` | manager              | front-end | [`StatusEvent`] |
//! | worker stdin   | manager              | worker    | [`BreakCommand`] |
//!
//! Commands stay inside the serve process and are plain enums. Everything
//! that crosses the worker process boundary ([`StatusEvent`] on stdout,
//! [`BreakCommand`] on stdin) travels as newline-delimited JSON; the wire
//! field names `break` and `tank_status` are fixed for compatibility with
//! existing clients.

use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Capacity used for all inter-actor channels.
pub const CHANNEL_CAPACITY: usize = 64;

/// Session state as visible to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepted by the front-end, not yet reported on by the worker.
    Starting,
    Running,
    Success,
    Failed,
    /// Held at the `start` break with `prepare` completed.
    Prepared,
}

impl SessionStatus {
    /// Terminal states release the single-session slot.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Success | SessionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Success => "success",
            SessionStatus::Failed => "failed",
            SessionStatus::Prepared => "prepared",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded stage failure. The list is append-only within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub stage: Stage,
    pub reason: String,
}

/// Status message describing one session.
///
/// The same shape serves three purposes: the worker's per-transition
/// emissions (all stage fields set), manager-synthesized terminal reports
/// (stage fields absent, `reason` set), and the front-end's stored view
/// which is returned verbatim from `GET /status` and dumped to
/// `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_completed: Option<bool>,
    #[serde(rename = "break", default, skip_serializing_if = "Option::is_none")]
    pub break_at: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failures: Option<Vec<Failure>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retcode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tank_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StatusEvent {
    /// A manager-synthesized terminal report carrying only a reason.
    pub fn synthesized(session: impl Into<String>, status: SessionStatus, reason: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            status,
            current_stage: None,
            stage_completed: None,
            break_at: None,
            failures: None,
            retcode: None,
            tank_status: None,
            reason: Some(reason.into()),
        }
    }

    /// The front-end stub installed at admission time.
    pub fn starting(session: impl Into<String>, break_at: Stage) -> Self {
        Self {
            session: session.into(),
            status: SessionStatus::Starting,
            current_stage: None,
            stage_completed: None,
            break_at: Some(break_at),
            failures: None,
            retcode: None,
            tank_status: None,
            reason: None,
        }
    }
}

/// Command from the front-end to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start a new session (`config` present) or advance the break of the
    /// already-running one (`config` absent).
    Run {
        session: String,
        break_at: Stage,
        config: Option<Vec<u8>>,
    },
    /// Soft-stop the named session.
    Stop { session: String },
}

/// Everything the manager's single inbound queue can carry.
#[derive(Debug)]
pub enum ManagerMessage {
    Command(Command),
    Status(StatusEvent),
}

/// Break request sent to the worker over its stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakCommand {
    #[serde(rename = "break")]
    pub break_at: Stage,
}
