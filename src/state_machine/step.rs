use std::fmt;

use super::job::Job;
use super::state::{Phase, State};
use crate::error::StepError;

/// Which budget a step is checked against before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// `task_timeout` since `last_update`.
    Stall,
    /// `wait_timeout` since `last_update`.
    WaitBudget,
    None,
}

/// One operation of the state machine. The registry maps a job's current state to
/// one of these; the engine executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// CREATED → STARTED, for both workflow kinds.
    Start,
    /// Fan out one child per module of the phase.
    Initialize(Phase),
    /// Fan-in barrier: advance once every child has left a marker.
    Wait(Phase),
    /// Read the phase's markers, persist results, escalate on child timeouts.
    Collect(Phase),
    /// Record the run as completed on the checklist.
    UpdateChecklist,
    /// Root graceful terminal: purge stale markers.
    Succeed,
    /// Child: run the module and leave a marker.
    Process,
    /// Child graceful terminal.
    Cleanup,
    /// Hard terminal for both workflow kinds.
    Fail,
}

impl Step {
    pub fn timeout_policy(self) -> TimeoutPolicy {
        match self {
            Step::Wait(_) | Step::Succeed | Step::Cleanup => TimeoutPolicy::WaitBudget,
            Step::Fail => TimeoutPolicy::None,
            _ => TimeoutPolicy::Stall,
        }
    }

    /// Graceful terminals retry within the wait budget and are abandoned, not
    /// escalated, once it runs out.
    pub fn is_graceful(self) -> bool {
        matches!(self, Step::Succeed | Step::Cleanup)
    }

    /// Terminal steps are never republished after they succeed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Step::Succeed | Step::Cleanup | Step::Fail)
    }

    /// Checks the step's budget against `now`.
    pub fn detect_timeout(self, job: &Job, now: i64) -> Result<(), StepError> {
        let idle = job.idle_for(now);
        match self.timeout_policy() {
            TimeoutPolicy::Stall if idle > job.task_timeout => Err(StepError::Stall {
                idle,
                limit: job.task_timeout,
            }),
            TimeoutPolicy::WaitBudget if idle > job.wait_timeout => {
                Err(StepError::WaitBudget {
                    waited: idle,
                    limit: job.wait_timeout,
                })
            }
            _ => Ok(()),
        }
    }

    /// The state a successful run of this step leaves the job in. Fan-out steps may
    /// skip ahead to the waited state when there is nothing to wait for, and wait
    /// steps stay put until the barrier opens; the engine handles both.
    pub fn next_state(self) -> State {
        match self {
            Step::Start => State::Started,
            Step::Initialize(phase) => phase.initialized_state(),
            Step::Wait(phase) => phase.waited_state(),
            Step::Collect(phase) => phase.collected_state().unwrap_or(phase.waited_state()),
            Step::UpdateChecklist => State::UpdatedChecklist,
            Step::Succeed | Step::Cleanup => State::Success,
            Step::Process => State::Processed,
            Step::Fail => State::Failed,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Start => write!(f, "start"),
            Step::Initialize(phase) => write!(f, "initialize_{phase}"),
            Step::Wait(phase) => write!(f, "wait_{phase}"),
            Step::Collect(phase) => write!(f, "collect_{phase}"),
            Step::UpdateChecklist => write!(f, "update_checklist"),
            Step::Succeed => write!(f, "succeed"),
            Step::Process => write!(f, "process"),
            Step::Cleanup => write!(f, "cleanup"),
            Step::Fail => write!(f, "fail"),
        }
    }
}
