use serde::{Deserialize, Serialize};

use super::state::{Phase, State, WorkflowKind};
use crate::config::RunSettings;

/// Backoff policy for republishing after a transient failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// The message payload. A copy is republished after every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub organization_id: String,
    pub checklist_id: String,
    /// Logical run timestamp shared by a root job and all of its children.
    pub created_at: i64,

    pub state: State,
    #[serde(default)]
    pub tries_count: u32,
    pub max_retries: u32,

    pub last_update: i64,
    /// Stall budget in seconds.
    pub task_timeout: i64,
    /// Fan-in and grace budget in seconds.
    pub wait_timeout: i64,

    #[serde(default)]
    pub children_count: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_type: Option<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Job {
    /// A fresh root job for one checklist run.
    pub fn root(
        organization_id: impl Into<String>,
        checklist_id: impl Into<String>,
        created_at: i64,
        settings: &RunSettings,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            checklist_id: checklist_id.into(),
            created_at,
            state: State::Created,
            tries_count: 0,
            max_retries: settings.max_retries,
            last_update: created_at,
            task_timeout: settings.task_timeout,
            wait_timeout: settings.wait_timeout,
            children_count: 0,
            module: None,
            module_type: None,
            reason: None,
        }
    }

    /// A child job running `module` for `phase`, inheriting the parent's identity
    /// and budgets.
    pub fn child(&self, module: impl Into<String>, phase: Phase, now: i64) -> Self {
        Self {
            organization_id: self.organization_id.clone(),
            checklist_id: self.checklist_id.clone(),
            created_at: self.created_at,
            state: State::Created,
            tries_count: 0,
            max_retries: self.max_retries,
            last_update: now,
            task_timeout: self.task_timeout,
            wait_timeout: self.wait_timeout,
            children_count: 0,
            module: Some(module.into()),
            module_type: Some(phase),
            reason: None,
        }
    }

    pub fn workflow_kind(&self) -> WorkflowKind {
        if self.module.is_some() {
            WorkflowKind::Child
        } else {
            WorkflowKind::Root
        }
    }

    /// Deterministic identity of the job within its run. Child keys are
    /// `{organization_id}/{created_at}/{phase}/{module}`.
    pub fn job_key(&self) -> String {
        match (&self.module, self.module_type) {
            (Some(module), Some(phase)) => format!(
                "{}/{}/{}/{}",
                self.organization_id, self.created_at, phase, module
            ),
            (Some(module), None) => {
                format!("{}/{}/-/{}", self.organization_id, self.created_at, module)
            }
            _ => format!(
                "{}/{}/{}",
                self.organization_id, self.checklist_id, self.created_at
            ),
        }
    }

    /// Seconds elapsed since the last successful step.
    pub fn idle_for(&self, now: i64) -> i64 {
        now - self.last_update
    }
}
