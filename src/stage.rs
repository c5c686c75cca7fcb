//! Stage model for the engine execution pipeline.
//!
//! The engine runs through a fixed sequence of named stages. Each stage
//! declares the predecessor that must have completed successfully before it
//! may execute. Note that the teardown stages (`end`, `unlock`) depend on
//! `lock` rather than on the middle of the pipeline, so cleanup still runs
//! when the test itself failed partway through, and `postprocess` depends on
//! `end` and is skipped when `end` failed.
//!
//! A *break* is a stage name designating the frontier beyond which the
//! worker must not advance without a new command; `finished` means run to
//! completion.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A single step of the engine pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Init,
    Lock,
    Configure,
    Prepare,
    Start,
    Poll,
    End,
    Postprocess,
    Unlock,
    /// Terminal marker; never executed, only reported.
    Finished,
}

/// Canonical execution order with the predecessor each stage requires.
///
/// The orchestrator is driven by this table; nothing else encodes the
/// pipeline shape.
pub const STAGE_ORDER_AND_DEPS: [(Stage, Option<Stage>); 10] = [
    (Stage::Init, None),
    (Stage::Lock, Some(Stage::Init)),
    (Stage::Configure, Some(Stage::Lock)),
    (Stage::Prepare, Some(Stage::Configure)),
    (Stage::Start, Some(Stage::Prepare)),
    (Stage::Poll, Some(Stage::Start)),
    (Stage::End, Some(Stage::Lock)),
    (Stage::Postprocess, Some(Stage::End)),
    (Stage::Unlock, Some(Stage::Lock)),
    (Stage::Finished, None),
];

/// Error returned when parsing an unknown stage name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown stage name: {0}")]
pub struct UnknownStage(pub String);

impl Stage {
    /// All stages in canonical order.
    pub fn all() -> impl Iterator<Item = Stage> {
        STAGE_ORDER_AND_DEPS.iter().map(|(stage, _)| *stage)
    }

    /// The stages the worker actually executes, in order (everything up to
    /// but excluding `finished`).
    pub fn executable() -> impl Iterator<Item = Stage> {
        Stage::all().filter(|stage| *stage != Stage::Finished)
    }

    /// Valid break names, for client-facing hints.
    pub fn names() -> Vec<&'static str> {
        Stage::all().map(Stage::as_str).collect()
    }

    /// Position in the canonical order.
    fn index(self) -> usize {
        STAGE_ORDER_AND_DEPS
            .iter()
            .position(|(stage, _)| *stage == self)
            .expect("every stage appears in the canonical table")
    }

    /// Strict "runs earlier than" comparison on the canonical order.
    pub fn is_earlier(self, other: Stage) -> bool {
        self.index() < other.index()
    }

    /// The stage that must have completed before this one may run.
    pub fn predecessor(self) -> Option<Stage> {
        STAGE_ORDER_AND_DEPS
            .iter()
            .find(|(stage, _)| *stage == self)
            .and_then(|(_, dep)| *dep)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Lock => "lock",
            Stage::Configure => "configure",
            Stage::Prepare => "prepare",
            Stage::Start => "start",
            Stage::Poll => "poll",
            Stage::End => "end",
            Stage::Postprocess => "postprocess",
            Stage::Unlock => "unlock",
            Stage::Finished => "finished",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::all()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}
