use std::collections::HashMap;

use super::job::Job;
use super::state::{Phase, State, WorkflowKind};
use super::step::Step;

/// `state -> step` for one workflow kind.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    steps: HashMap<State, Step>,
}

impl TransitionTable {
    /// The three-phase pipeline driven by a root job.
    pub fn root() -> Self {
        let steps = HashMap::from([
            (State::Created, Step::Start),
            (State::Started, Step::Initialize(Phase::Recommendation)),
            (State::InitializedChecklist, Step::Wait(Phase::Recommendation)),
            (State::WaitedChecklist, Step::Collect(Phase::Recommendation)),
            (State::CollectedCheckResult, Step::Initialize(Phase::Archive)),
            (State::InitializedArchive, Step::Wait(Phase::Archive)),
            (State::WaitedArchive, Step::Collect(Phase::Archive)),
            (State::CheckedArchiveResult, Step::Initialize(Phase::Service)),
            (State::InitializedService, Step::Wait(Phase::Service)),
            (State::WaitedService, Step::UpdateChecklist),
            (State::UpdatedChecklist, Step::Succeed),
            (State::Error, Step::Fail),
        ]);
        Self { steps }
    }

    /// A child job runs exactly one module.
    pub fn child() -> Self {
        let steps = HashMap::from([
            (State::Created, Step::Start),
            (State::Started, Step::Process),
            (State::Processed, Step::Cleanup),
            (State::Error, Step::Fail),
        ]);
        Self { steps }
    }

    pub fn step_for(&self, state: State) -> Option<Step> {
        self.steps.get(&state).copied()
    }
}

/// Both transition tables, keyed by workflow kind.
#[derive(Debug, Clone)]
pub struct Registry {
    root: TransitionTable,
    child: TransitionTable,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            root: TransitionTable::root(),
            child: TransitionTable::child(),
        }
    }
}

impl Registry {
    pub fn table(&self, kind: WorkflowKind) -> &TransitionTable {
        match kind {
            WorkflowKind::Root => &self.root,
            WorkflowKind::Child => &self.child,
        }
    }

    /// The step to run for this delivery, or `None` when the job has nothing left to do.
    pub fn lookup(&self, job: &Job) -> Option<Step> {
        self.table(job.workflow_kind()).step_for(job.state)
    }
}
