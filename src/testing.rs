//! Shared fixtures for unit tests: a step engine wired to in-memory collaborators
//! and a manual clock, plus collaborators that fail on demand.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::clock::{Clock, ManualClock};
use crate::config::{ModuleLists, RunSettings};
use crate::engine::{Collaborators, StepEngine};
use crate::error::{EngineError, Result};
use crate::executor::{ModuleExecutor, ModuleOutput};
use crate::notify::{NotificationKind, Notifier};
use crate::state_machine::{Job, Phase, RetryConfig};
use crate::store::{Checklist, MarkerStore, MemoryChecklistStore, MemoryMarkerStore, MemoryResultStore};

pub const START: i64 = 1_700_000_000;

pub fn settings() -> RunSettings {
    RunSettings {
        task_timeout: 600,
        wait_timeout: 1_800,
        max_retries: 3,
        run_period: 86_400,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlakyOp {
    Put,
    List,
    Delete,
}

/// Memory marker store whose operations can be made to fail, optionally after
/// moving the clock forward.
pub struct FlakyMarkerStore {
    pub inner: MemoryMarkerStore,
    clock: Arc<ManualClock>,
    failures: Mutex<HashMap<FlakyOp, (u32, i64)>>,
}

impl FlakyMarkerStore {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: MemoryMarkerStore::new(),
            clock,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail(&self, op: FlakyOp, times: u32) {
        self.fail_slowly(op, times, 0);
    }

    /// The next `times` calls of `op` advance the clock by `secs`, then fail.
    pub fn fail_slowly(&self, op: FlakyOp, times: u32, secs: i64) {
        self.failures.lock().unwrap().insert(op, (times, secs));
    }

    fn check(&self, op: FlakyOp) -> Result<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&op) {
            Some((times, secs)) if *times > 0 => {
                *times -= 1;
                self.clock.advance(*secs);
                Err(EngineError::MarkerStore(format!("injected {op:?} failure")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl MarkerStore for FlakyMarkerStore {
    async fn put(&self, key: &str, payload: Vec<u8>) -> Result<bool> {
        self.check(FlakyOp::Put)?;
        self.inner.put(key, payload).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.check(FlakyOp::List)?;
        self.inner.list(prefix).await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        self.check(FlakyOp::Delete)?;
        self.inner.delete_many(keys).await
    }
}

/// Executor with per-module canned errors. Can move the clock to simulate slow runs.
pub struct ScriptedExecutor {
    clock: Arc<ManualClock>,
    errors: Mutex<HashMap<String, String>>,
    run_secs: AtomicI64,
    runs: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            errors: Mutex::new(HashMap::new()),
            run_secs: AtomicI64::new(0),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_module(&self, module: &str, error: &str) {
        self.errors
            .lock()
            .unwrap()
            .insert(module.to_string(), error.to_string());
    }

    pub fn advance_clock_on_run(&self, secs: i64) {
        self.run_secs.store(secs, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModuleExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        module: &str,
        phase: Phase,
        _organization_id: &str,
        _run_timestamp: i64,
    ) -> ModuleOutput {
        self.runs.lock().unwrap().push(module.to_string());
        self.clock.advance(self.run_secs.load(Ordering::SeqCst));
        if let Some(error) = self.errors.lock().unwrap().get(module) {
            return ModuleOutput::error(error.clone());
        }
        ModuleOutput::data(json!({ "module": module, "phase": phase }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: tokio::sync::Mutex<Vec<(NotificationKind, String, Value)>>,
}

impl RecordingNotifier {
    pub async fn sent(&self) -> Vec<(NotificationKind, String, Value)> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, kind: NotificationKind, organization_id: &str, context: &Value) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((kind, organization_id.to_string(), context.clone()));
        Ok(())
    }
}

/// A step engine over in-memory collaborators. The clock starts at [`START`] and
/// `chk-1` of `org-1` has a run claimed at [`START`].
pub struct Fixture {
    pub engine: StepEngine,
    pub clock: Arc<ManualClock>,
    pub markers: Arc<FlakyMarkerStore>,
    pub checklists: Arc<MemoryChecklistStore>,
    pub results: Arc<MemoryResultStore>,
    pub executor: Arc<ScriptedExecutor>,
    pub notifier: Arc<RecordingNotifier>,
    pub modules: ModuleLists,
}

impl Fixture {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START));
        let checklist = Checklist {
            next_run: START + settings().run_period,
            last_run: START,
            last_completed: START - settings().run_period,
            ..Checklist::new("chk-1", "org-1")
        };
        let markers = Arc::new(FlakyMarkerStore::new(clock.clone()));
        let checklists = Arc::new(MemoryChecklistStore::with_checklists([checklist]));
        let results = Arc::new(MemoryResultStore::new());
        let executor = Arc::new(ScriptedExecutor::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::default());
        let modules = ModuleLists::default();
        let engine = build_engine(Collaborators {
            markers: markers.clone(),
            checklists: checklists.clone(),
            results: results.clone(),
            catalog: Arc::new(modules.clone()),
            executor: executor.clone(),
            notifier: Some(notifier.clone() as Arc<dyn Notifier>),
            clock: clock.clone(),
        });
        Self {
            engine,
            clock,
            markers,
            checklists,
            results,
            executor,
            notifier,
            modules,
        }
    }

    pub fn with_modules(mut self, phase: Phase, names: &[&str]) -> Self {
        let names = names.iter().map(|n| n.to_string()).collect();
        match phase {
            Phase::Recommendation => self.modules.recommendation = names,
            Phase::Archive => self.modules.archive = names,
            Phase::Service => self.modules.service = names,
        }
        self.engine = build_engine(self.collaborators());
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            markers: self.markers.clone(),
            checklists: self.checklists.clone(),
            results: self.results.clone(),
            catalog: Arc::new(self.modules.clone()),
            executor: self.executor.clone(),
            notifier: Some(self.notifier.clone() as Arc<dyn Notifier>),
            clock: self.clock.clone(),
        }
    }

    /// The root job of the run claimed at [`START`].
    pub fn root_job(&self) -> Job {
        Job::root("org-1", "chk-1", START, &settings())
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }
}

fn build_engine(deps: Collaborators) -> StepEngine {
    StepEngine::new(deps)
        .with_poll_delay(Duration::from_secs(5))
        .with_retry_backoff(RetryConfig {
            max_retries: 3,
            base_delay_ms: 10,
        })
}
