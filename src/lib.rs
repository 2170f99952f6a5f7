//! checkflow: a checklist scheduler and a message-driven job engine.
//!
//! The [`scheduler`] claims due checklists and emits root jobs. [`worker`]s consume
//! the queue and hand every delivery to the [`engine`], which advances the job by a
//! single step of its state machine and republishes it. Root jobs fan out one child
//! per module and wait on a marker-store barrier for all of them.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;
