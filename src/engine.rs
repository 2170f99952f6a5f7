//! The step engine: advances one job by exactly one step per delivery.
//!
//! Each call to [`StepEngine::advance`] looks up the step for the job's workflow kind
//! and state, checks the step's timeout budget, runs it, and returns the messages
//! that carry the job forward. Nothing blocks across a wait: a closed barrier is
//! expressed as a delayed republish of the unchanged job.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::Instrument;

use crate::clock::Clock;
use crate::error::{EngineError, StepError};
use crate::executor::{ModuleCatalog, ModuleExecutor, distinct_modules};
use crate::notify::{NotificationKind, Notifier};
use crate::queue::OutboundMessage;
use crate::state_machine::{Job, Phase, Registry, RetryConfig, State, Step, TimeoutPolicy, WorkflowKind};
use crate::store::{
    ChecklistPatch, ChecklistStore, Marker, MarkerKey, MarkerStore, ModuleResult, PhaseResults,
    ResultStore, read_markers,
};

/// How a delivery ended.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step ran and the job moved on.
    Advanced { from: State, to: State },
    /// A barrier is still closed; the unchanged job was republished.
    Waiting { ready: usize, expected: usize },
    /// A terminal step finished. Nothing is republished.
    Completed(State),
    /// The step failed and will be attempted again.
    Retrying(StepError),
    /// The step failed for good; the job now heads to FAILED.
    Escalated(StepError),
    /// A graceful terminal ran out of budget and was given up.
    Abandoned(StepError),
    /// Nothing to do with this message.
    Dropped(String),
}

/// Result of one delivery: what happened, and what to publish before acking.
#[derive(Debug)]
pub struct StepReport {
    pub step: Option<Step>,
    pub outcome: StepOutcome,
    pub outbound: Vec<OutboundMessage>,
}

impl StepReport {
    fn dropped(step: Option<Step>, why: impl Into<String>) -> Self {
        Self {
            step,
            outcome: StepOutcome::Dropped(why.into()),
            outbound: Vec::new(),
        }
    }
}

/// What a successful step asks the engine to do with the job.
enum Effect {
    Advance { children: Vec<Job> },
    Wait { ready: usize, expected: usize },
    Finish,
}

/// External collaborators used by the steps.
#[derive(Clone)]
pub struct Collaborators {
    pub markers: Arc<dyn MarkerStore>,
    pub checklists: Arc<dyn ChecklistStore>,
    pub results: Arc<dyn ResultStore>,
    pub catalog: Arc<dyn ModuleCatalog>,
    pub executor: Arc<dyn ModuleExecutor>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub clock: Arc<dyn Clock>,
}

pub struct StepEngine {
    registry: Registry,
    deps: Collaborators,
    /// Redelivery delay for closed barriers and graceful retries.
    poll_delay: Duration,
    /// Backoff between transient retries.
    retry: RetryConfig,
}

impl StepEngine {
    pub fn new(deps: Collaborators) -> Self {
        Self {
            registry: Registry::default(),
            deps,
            poll_delay: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    pub fn with_retry_backoff(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs one step of `job`. Never fails: step errors are folded into the outcome
    /// and the follow-up messages.
    pub async fn advance(&self, job: Job) -> StepReport {
        let span = tracing::info_span!(
            "step",
            organization_id = %job.organization_id,
            checklist_id = %job.checklist_id,
            created_at = job.created_at,
            state = %job.state,
            module = job.module.as_deref().unwrap_or("-"),
        );
        self.advance_inner(job).instrument(span).await
    }

    async fn advance_inner(&self, job: Job) -> StepReport {
        let Some(step) = self.registry.lookup(&job) else {
            tracing::warn!(kind = %job.workflow_kind(), "no step for state, dropping message");
            return StepReport::dropped(None, format!("no {} step for {}", job.workflow_kind(), job.state));
        };

        let now = self.deps.clock.now();
        let mut next = job.clone();
        let result = match step.detect_timeout(&job, now) {
            Ok(()) => self.execute(step, &mut next, now).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(Effect::Advance { children }) => {
                next.last_update = now;
                next.tries_count = 0;
                tracing::debug!(%step, to = %next.state, children = children.len(), "step done");
                let mut outbound: Vec<_> = children.into_iter().map(OutboundMessage::unique).collect();
                let to = next.state;
                outbound.push(OutboundMessage::new(next));
                StepReport {
                    step: Some(step),
                    outcome: StepOutcome::Advanced { from: job.state, to },
                    outbound,
                }
            }
            Ok(Effect::Wait { ready, expected }) => {
                tracing::debug!(%step, ready, expected, "barrier closed");
                StepReport {
                    step: Some(step),
                    outcome: StepOutcome::Waiting { ready, expected },
                    outbound: vec![OutboundMessage::delayed(job, self.poll_delay)],
                }
            }
            Ok(Effect::Finish) => StepReport {
                step: Some(step),
                outcome: StepOutcome::Completed(next.state),
                outbound: Vec::new(),
            },
            Err(e) => self.handle_failure(step, job, e).await,
        }
    }

    async fn execute(&self, step: Step, job: &mut Job, now: i64) -> Result<Effect, StepError> {
        match step {
            Step::Start => {
                job.state = State::Started;
                if job.workflow_kind() == WorkflowKind::Root {
                    tracing::info!("checklist run started");
                }
                Ok(Effect::Advance { children: Vec::new() })
            }
            Step::Initialize(phase) => self.fan_out(job, phase, now).await,
            Step::Wait(phase) => self.fan_in(job, phase).await,
            Step::Collect(phase) => self.collect(job, phase).await,
            Step::UpdateChecklist => {
                let applied = self
                    .deps
                    .checklists
                    .patch(&job.checklist_id, &ChecklistPatch::complete(job.created_at))
                    .await?;
                if !applied {
                    tracing::warn!("checklist claimed by a newer run, completion not recorded");
                }
                job.state = State::UpdatedChecklist;
                Ok(Effect::Advance { children: Vec::new() })
            }
            Step::Succeed => {
                let purged = self.purge_stale_markers(job).await?;
                job.state = State::Success;
                tracing::info!(purged, "checklist run succeeded");
                Ok(Effect::Finish)
            }
            Step::Process => self.process(job, now).await,
            Step::Cleanup => {
                let (module, phase) = child_identity(job)?;
                self.deps
                    .executor
                    .cleanup(module, phase, &job.organization_id, job.created_at)
                    .await?;
                job.state = State::Success;
                tracing::debug!("module finished");
                Ok(Effect::Finish)
            }
            Step::Fail => self.fail(job).await,
        }
    }

    /// Emits one child per module. An empty list skips the phase's wait step.
    async fn fan_out(&self, job: &mut Job, phase: Phase, now: i64) -> Result<Effect, StepError> {
        let names = self.deps.catalog.modules(&job.organization_id, phase).await?;
        let children: Vec<Job> = distinct_modules(names)
            .into_iter()
            .map(|module| job.child(module, phase, now))
            .collect();

        job.children_count = children.len();
        job.state = if children.is_empty() {
            phase.waited_state()
        } else {
            phase.initialized_state()
        };
        tracing::info!(%phase, children = children.len(), "fan-out");
        Ok(Effect::Advance { children })
    }

    /// Opens once every child of the phase has left a marker.
    async fn fan_in(&self, job: &mut Job, phase: Phase) -> Result<Effect, StepError> {
        let prefix = MarkerKey::phase_prefix(&job.organization_id, job.created_at, phase);
        let ready = self.deps.markers.count(&prefix).await?;
        let expected = job.children_count;
        if ready < expected {
            return Ok(Effect::Wait { ready, expected });
        }
        if ready > expected {
            tracing::warn!(%phase, ready, expected, "more markers than children");
        }
        job.state = phase.waited_state();
        tracing::info!(%phase, ready, "barrier open");
        Ok(Effect::Advance { children: Vec::new() })
    }

    async fn collect(&self, job: &mut Job, phase: Phase) -> Result<Effect, StepError> {
        let prefix = MarkerKey::phase_prefix(&job.organization_id, job.created_at, phase);
        let markers = read_markers(self.deps.markers.as_ref(), &prefix).await?;

        let timed_out: Vec<String> = markers
            .iter()
            .filter(|m| m.timeout_error)
            .map(|m| m.module.clone())
            .collect();
        if !timed_out.is_empty() {
            return Err(StepError::ChildTimeout(timed_out));
        }

        let results = PhaseResults {
            organization_id: job.organization_id.clone(),
            checklist_id: job.checklist_id.clone(),
            created_at: job.created_at,
            phase,
            modules: markers.into_iter().map(ModuleResult::from).collect(),
        };
        let failed = results.errors().count();
        if failed > 0 {
            tracing::warn!(%phase, failed, "modules reported errors");
        }
        self.deps.results.save(&results).await?;

        job.state = phase.collected_state().unwrap_or(phase.waited_state());
        Ok(Effect::Advance { children: Vec::new() })
    }

    /// Runs the child's module within what is left of its task budget and records
    /// the outcome as the child's marker.
    async fn process(&self, job: &mut Job, now: i64) -> Result<Effect, StepError> {
        let (module, phase) = child_identity(job)?;
        let remaining = (job.task_timeout - job.idle_for(now)).max(0) as u64;

        let run = self
            .deps
            .executor
            .execute(module, phase, &job.organization_id, job.created_at);
        let output = match tokio::time::timeout(Duration::from_secs(remaining), run).await {
            Ok(output) => output,
            Err(_) => return Err(self.stall(job)),
        };
        // The executor may have outlived the budget on the engine's clock.
        if job.idle_for(self.deps.clock.now()) > job.task_timeout {
            return Err(self.stall(job));
        }

        let marker = match output.error {
            Some(error) => {
                tracing::warn!(%error, "module reported an error");
                Marker::failed(module, error)
            }
            None => Marker::completed(module, output.data, output.options),
        };
        let key = MarkerKey::new(&job.organization_id, job.created_at, phase, module);
        if !self.deps.markers.put(&key.to_string(), marker.to_bytes()?).await? {
            tracing::debug!(%key, "marker already present");
        }

        job.state = State::Processed;
        Ok(Effect::Advance { children: Vec::new() })
    }

    /// Hard terminal. Root jobs close the checklist run and notify; children leave an
    /// error marker so their parent's barrier still sees them.
    async fn fail(&self, job: &mut Job) -> Result<Effect, StepError> {
        let reason = job.reason.clone().unwrap_or_else(|| "unknown".to_string());
        match job.workflow_kind() {
            WorkflowKind::Root => {
                let applied = self
                    .deps
                    .checklists
                    .patch(&job.checklist_id, &ChecklistPatch::complete(job.created_at))
                    .await?;
                if !applied {
                    tracing::warn!("checklist claimed by a newer run, failure not recorded");
                }
                tracing::error!(%reason, "checklist run failed");
                self.notify_failure(job, &reason).await;
            }
            WorkflowKind::Child => {
                let (module, phase) = child_identity(job)?;
                let key = MarkerKey::new(&job.organization_id, job.created_at, phase, module);
                let marker = Marker::failed(module, reason.clone());
                self.deps.markers.put(&key.to_string(), marker.to_bytes()?).await?;
                tracing::error!(%reason, "module failed");
            }
        }
        job.state = State::Failed;
        Ok(Effect::Finish)
    }

    async fn notify_failure(&self, job: &Job, reason: &str) {
        let Some(notifier) = &self.deps.notifier else {
            return;
        };
        let context = self.failure_context(job, reason).await;
        if let Err(e) = notifier
            .notify(NotificationKind::RunFailed, &job.organization_id, &context)
            .await
        {
            tracing::error!(error = %e, "failed to send notification");
        }
    }

    async fn failure_context(&self, job: &Job, reason: &str) -> Value {
        let mut module_errors = Vec::new();
        for phase in Phase::ALL {
            let prefix = MarkerKey::phase_prefix(&job.organization_id, job.created_at, phase);
            match read_markers(self.deps.markers.as_ref(), &prefix).await {
                Ok(markers) => module_errors.extend(markers.into_iter().filter_map(|m| {
                    m.error.map(|error| {
                        json!({
                            "module": m.module,
                            "phase": phase,
                            "error": error,
                            "timeout": m.timeout_error,
                        })
                    })
                })),
                Err(e) => tracing::warn!(%phase, error = %e, "could not read markers for notification"),
            }
        }
        json!({
            "checklist_id": job.checklist_id,
            "created_at": job.created_at,
            "reason": reason,
            "module_errors": module_errors,
        })
    }

    /// Deletes the organization's markers left over from older runs. Markers of a
    /// newer run belong to a live barrier and are kept.
    async fn purge_stale_markers(&self, job: &Job) -> Result<usize, EngineError> {
        let prefix = MarkerKey::organization_prefix(&job.organization_id);
        let stale: Vec<String> = self
            .deps
            .markers
            .list(&prefix)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| MarkerKey::run_of(key).is_some_and(|run| run < job.created_at))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        self.deps.markers.delete_many(&stale).await
    }

    fn stall(&self, job: &Job) -> StepError {
        StepError::Stall {
            idle: job.idle_for(self.deps.clock.now()),
            limit: job.task_timeout,
        }
    }

    async fn handle_failure(&self, step: Step, mut job: Job, err: StepError) -> StepReport {
        let now = self.deps.clock.now();
        if step == Step::Fail {
            tracing::error!(error = %err, "could not finish failed job, dropping it");
            return StepReport::dropped(Some(step), err.to_string());
        }

        if step.is_graceful() {
            let within_budget = job.idle_for(now) <= job.wait_timeout;
            if within_budget && !matches!(err, StepError::WaitBudget { .. }) {
                tracing::warn!(%step, error = %err, "terminal step failed, retrying");
                return StepReport {
                    step: Some(step),
                    outcome: StepOutcome::Retrying(err),
                    outbound: vec![OutboundMessage::delayed(job, self.poll_delay)],
                };
            }
            tracing::warn!(%step, error = %err, "terminal step out of budget, abandoning job");
            return StepReport {
                step: Some(step),
                outcome: StepOutcome::Abandoned(err),
                outbound: Vec::new(),
            };
        }

        // A transient failure past the task budget is a stall.
        let err = match err {
            StepError::Transient(e)
                if step.timeout_policy() == TimeoutPolicy::Stall && job.idle_for(now) > job.task_timeout =>
            {
                tracing::warn!(error = %e, "failure after task timeout, treating as stall");
                StepError::Stall {
                    idle: job.idle_for(now),
                    limit: job.task_timeout,
                }
            }
            other => other,
        };

        if step == Step::Process && matches!(err, StepError::Stall { .. }) {
            self.write_timeout_marker(&job, &err).await;
        }

        if err.is_retryable() {
            job.tries_count += 1;
            if job.tries_count < job.max_retries {
                let delay_ms = self.retry.delay_for_attempt(job.tries_count);
                tracing::warn!(
                    %step,
                    tries = job.tries_count,
                    max = job.max_retries,
                    delay_ms,
                    error = %err,
                    "step failed, retrying"
                );
                return StepReport {
                    step: Some(step),
                    outcome: StepOutcome::Retrying(err),
                    outbound: vec![OutboundMessage::delayed(job, Duration::from_millis(delay_ms))],
                };
            }
        }

        let reason = err.reason();
        tracing::error!(%step, %reason, tries = job.tries_count, "step failed, escalating");
        job.state = State::Error;
        job.reason = Some(reason);
        StepReport {
            step: Some(step),
            outcome: StepOutcome::Escalated(err),
            outbound: vec![OutboundMessage::new(job)],
        }
    }

    /// Leaves a `timeout_error` marker so the parent's barrier opens and its result
    /// collection sees the timeout.
    async fn write_timeout_marker(&self, job: &Job, err: &StepError) {
        let Ok((module, phase)) = child_identity(job) else {
            return;
        };
        let key = MarkerKey::new(&job.organization_id, job.created_at, phase, module);
        let written = match Marker::timed_out(module, err.reason()).to_bytes() {
            Ok(payload) => self.deps.markers.put(&key.to_string(), payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::error!(%key, error = %e, "could not write timeout marker");
        }
    }
}

fn child_identity(job: &Job) -> Result<(&str, Phase), EngineError> {
    match (job.module.as_deref(), job.module_type) {
        (Some(module), Some(phase)) => Ok((module, phase)),
        _ => Err(EngineError::MalformedJob(format!(
            "child job without module or module_type: {}",
            job.job_key()
        ))),
    }
}
