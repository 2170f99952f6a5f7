use std::fmt;

use serde::{Deserialize, Serialize};

/// Every state a job can be in. Root jobs walk the full pipeline; child jobs only use
/// `Created`, `Started`, `Processed` and the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Created,
    Started,
    InitializedChecklist,
    WaitedChecklist,
    CollectedCheckResult,
    InitializedArchive,
    WaitedArchive,
    CheckedArchiveResult,
    InitializedService,
    WaitedService,
    UpdatedChecklist,
    Processed,
    Success,
    Error,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Created => "CREATED",
            State::Started => "STARTED",
            State::InitializedChecklist => "INITIALIZED_CHECKLIST",
            State::WaitedChecklist => "WAITED_CHECKLIST",
            State::CollectedCheckResult => "COLLECTED_CHECK_RESULT",
            State::InitializedArchive => "INITIALIZED_ARCHIVE",
            State::WaitedArchive => "WAITED_ARCHIVE",
            State::CheckedArchiveResult => "CHECKED_ARCHIVE_RESULT",
            State::InitializedService => "INITIALIZED_SERVICE",
            State::WaitedService => "WAITED_SERVICE",
            State::UpdatedChecklist => "UPDATED_CHECKLIST",
            State::Processed => "PROCESSED",
            State::Success => "SUCCESS",
            State::Error => "ERROR",
            State::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// One of the three fan-out/fan-in rounds of a checklist run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Recommendation,
    Archive,
    Service,
}

impl Phase {
    /// Phases in pipeline order.
    pub const ALL: [Phase; 3] = [Phase::Recommendation, Phase::Archive, Phase::Service];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Recommendation => "recommendation",
            Phase::Archive => "archive",
            Phase::Service => "service",
        }
    }

    /// State after the phase's children have been emitted.
    pub fn initialized_state(self) -> State {
        match self {
            Phase::Recommendation => State::InitializedChecklist,
            Phase::Archive => State::InitializedArchive,
            Phase::Service => State::InitializedService,
        }
    }

    /// State after the phase's barrier has opened (or was skipped).
    pub fn waited_state(self) -> State {
        match self {
            Phase::Recommendation => State::WaitedChecklist,
            Phase::Archive => State::WaitedArchive,
            Phase::Service => State::WaitedService,
        }
    }

    /// State after the phase's results have been collected. The service phase has no
    /// collection step.
    pub fn collected_state(self) -> Option<State> {
        match self {
            Phase::Recommendation => Some(State::CollectedCheckResult),
            Phase::Archive => Some(State::CheckedArchiveResult),
            Phase::Service => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recommendation" => Ok(Phase::Recommendation),
            "archive" => Ok(Phase::Archive),
            "service" => Ok(Phase::Service),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Which transition table governs a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowKind {
    Root,
    Child,
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowKind::Root => write!(f, "root"),
            WorkflowKind::Child => write!(f, "child"),
        }
    }
}
