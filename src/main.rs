mod cli;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use checkflow::clock::{Clock, ManualClock, SystemClock};
use checkflow::config::{EngineConfig, ModuleLists};
use checkflow::engine::{Collaborators, StepEngine};
use checkflow::executor::SimulatedExecutor;
use checkflow::logging::init_tracing;
use checkflow::notify::{LogNotifier, Notifier, WebhookNotifier};
use checkflow::queue::{MemoryQueue, Publisher};
use checkflow::scheduler::ChecklistScheduler;
use checkflow::state_machine::Phase;
use checkflow::store::{
    Checklist, ChecklistStore, FsMarkerStore, JsonFileChecklistStore, MarkerStore, MemoryChecklistStore,
    MemoryMarkerStore, MemoryResultStore,
};
use checkflow::worker::Worker;
use cli::{Cli, Command};

/// Upper bound on the barrier poll interval while running the demo.
const DEMO_POLL_DELAY_MS: u64 = 500;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Schedule { checklists, now } => schedule(&config, checklists, now).await,
        Command::Demo {
            organizations,
            marker_dir,
            failing,
        } => demo(config, organizations, marker_dir, failing).await,
        Command::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn scheduler_for(
    config: &EngineConfig,
    checklists: Arc<dyn ChecklistStore>,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
) -> ChecklistScheduler {
    ChecklistScheduler::new(checklists, Arc::new(config.clone()), publisher, clock)
        .with_reschedule_timeout(config.reschedule_timeout_secs)
        .with_fallback_settings(config.default_run_settings())
}

/// One scheduling pass; the emitted root jobs go to stdout as JSON lines.
async fn schedule(config: &EngineConfig, path: PathBuf, now: Option<i64>) -> Result<()> {
    let clock: Arc<dyn Clock> = match now {
        Some(now) => Arc::new(ManualClock::new(now)),
        None => Arc::new(SystemClock),
    };
    let store = Arc::new(JsonFileChecklistStore::new(path.clone()));
    let queue = Arc::new(MemoryQueue::new());
    let scheduler = scheduler_for(config, store, Publisher::new(queue, config.publish_retry()), clock);

    let report = scheduler
        .run_pass()
        .await
        .with_context(|| format!("scheduling pass over {}", path.display()))?;
    for job in &report.jobs {
        println!("{}", serde_json::to_string(job)?);
    }
    Ok(())
}

async fn demo(
    mut config: EngineConfig,
    organizations: usize,
    marker_dir: Option<PathBuf>,
    failing: Vec<String>,
) -> Result<()> {
    if Phase::ALL.iter().all(|p| config.modules.for_phase(*p).is_empty()) {
        config.modules = demo_modules();
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let markers: Arc<dyn MarkerStore> = match marker_dir {
        Some(dir) => Arc::new(FsMarkerStore::new(dir)),
        None => Arc::new(MemoryMarkerStore::new()),
    };
    let checklists = Arc::new(MemoryChecklistStore::with_checklists((1..=organizations).map(|i| {
        Checklist::new(format!("checklist-{i}"), format!("org-{i}"))
    })));
    let results = Arc::new(MemoryResultStore::new());
    let executor = failing
        .into_iter()
        .fold(SimulatedExecutor::new(Duration::from_millis(50)), |executor, module| {
            executor.failing(module)
        });
    let notifier: Arc<dyn Notifier> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => Arc::new(LogNotifier),
    };

    let queue = Arc::new(MemoryQueue::new());
    let publisher = Publisher::new(queue.clone(), config.publish_retry());
    let engine = StepEngine::new(Collaborators {
        markers,
        checklists: checklists.clone(),
        results: results.clone(),
        catalog: Arc::new(config.modules.clone()),
        executor: Arc::new(executor),
        notifier: Some(notifier),
        clock: clock.clone(),
    })
    .with_poll_delay(Duration::from_millis(config.poll_delay_ms.min(DEMO_POLL_DELAY_MS)))
    .with_retry_backoff(config.step_retry());

    let pass = scheduler_for(&config, checklists.clone(), publisher.clone(), clock)
        .run_pass()
        .await?;

    let worker = Worker::new(Arc::new(engine), publisher).with_concurrency(config.concurrency);
    let stats = worker.stats();
    let progress = ui::DemoProgress::start(pass.jobs.len() as u64);

    let shutdown = async {
        let empty = queue.wait_until_empty(Duration::from_millis(50));
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(empty, interrupt);
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = &mut empty => break,
                _ = &mut interrupt => {
                    tracing::warn!("interrupted, finishing deliveries in progress");
                    break;
                }
                _ = tick.tick() => progress.update(&stats.snapshot()),
            }
        }
    };
    worker.run(shutdown).await?;

    let snapshot = stats.snapshot();
    progress.finish(&snapshot);

    let checklists = checklists.list().await?;
    let mut collected = Vec::new();
    for checklist in &checklists {
        for phase in Phase::ALL.into_iter().filter(|p| p.collected_state().is_some()) {
            if let Some(r) = results
                .get(&checklist.organization_id, checklist.last_run, phase)
                .await
            {
                collected.push(r);
            }
        }
    }
    progress.print_checklists(&checklists, &collected);
    Ok(())
}

fn demo_modules() -> ModuleLists {
    let names = |list: &[&str]| -> Vec<String> { list.iter().map(|s| s.to_string()).collect() };
    ModuleLists {
        recommendation: names(&["rightsizing", "idle_volumes", "reserved_instances"]),
        archive: names(&["snapshots", "stale_buckets"]),
        service: names(&["budget_sync", "tagging"]),
    }
}
