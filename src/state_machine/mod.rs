mod job;
mod registry;
mod state;
mod step;

pub use job::{Job, RetryConfig};
pub use registry::{Registry, TransitionTable};
pub use state::{Phase, State, WorkflowKind};
pub use step::{Step, TimeoutPolicy};
