//! Queue consumers. A worker receives a delivery, advances the job by one step,
//! publishes the follow-up messages and only then acknowledges.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::engine::{StepEngine, StepOutcome};
use crate::error::Result;
use crate::queue::{Delivery, JobQueue, MemoryQueue, Publisher};
use crate::state_machine::{State, WorkflowKind};

/// Running totals over every delivery a worker handled.
#[derive(Debug, Default)]
pub struct WorkerStats {
    deliveries: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    modules_done: AtomicU64,
    retries: AtomicU64,
    escalations: AtomicU64,
    abandoned: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub deliveries: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub modules_done: u64,
    pub retries: u64,
    pub escalations: u64,
    pub abandoned: u64,
    pub dropped: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            deliveries: self.deliveries.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            modules_done: self.modules_done.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, kind: WorkflowKind, outcome: &StepOutcome) {
        let counter = match (outcome, kind) {
            (StepOutcome::Completed(State::Success), WorkflowKind::Root) => &self.runs_succeeded,
            (StepOutcome::Completed(State::Failed), WorkflowKind::Root) => &self.runs_failed,
            (StepOutcome::Completed(_), WorkflowKind::Child) => &self.modules_done,
            (StepOutcome::Retrying(_), _) => &self.retries,
            (StepOutcome::Escalated(_), _) => &self.escalations,
            (StepOutcome::Abandoned(_), _) => &self.abandoned,
            (StepOutcome::Dropped(_), _) => &self.dropped,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
pub struct Worker {
    id: Uuid,
    engine: Arc<StepEngine>,
    publisher: Publisher,
    stats: Arc<WorkerStats>,
    concurrency: usize,
    idle_poll: Duration,
}

impl Worker {
    pub fn new(engine: Arc<StepEngine>, publisher: Publisher) -> Self {
        Self {
            id: Uuid::new_v4(),
            engine,
            publisher,
            stats: Arc::new(WorkerStats::default()),
            concurrency: 8,
            idle_poll: Duration::from_millis(100),
        }
    }

    /// Maximum number of deliveries handled at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// How long to sleep when the queue has nothing visible.
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    fn queue(&self) -> &Arc<dyn JobQueue> {
        self.publisher.queue()
    }

    /// Handles one delivery. An error means the delivery was left unacknowledged and
    /// will come back.
    pub async fn handle(&self, delivery: Delivery) -> Result<()> {
        self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
        let job = match delivery.job() {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(delivery = delivery.id, error = %e, "discarding malformed message");
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return self.queue().ack(delivery.id).await;
            }
        };

        let kind = job.workflow_kind();
        let report = self.engine.advance(job).await;

        if let Err(e) = self.publisher.publish(&report.outbound).await {
            tracing::error!(
                delivery = delivery.id,
                error = %e,
                "could not publish follow-up messages, leaving delivery unacknowledged"
            );
            return Err(e);
        }
        self.queue().ack(delivery.id).await?;

        tracing::debug!(
            delivery = delivery.id,
            attempt = delivery.attempt,
            step = report.step.map(|s| s.to_string()).unwrap_or_default(),
            outcome = ?report.outcome,
            "delivery handled"
        );
        self.stats.record(kind, &report.outcome);
        Ok(())
    }

    /// Consumes the queue until `shutdown` resolves, then waits for the deliveries
    /// already in progress.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let span = tracing::info_span!("worker", id = %self.id);
        self.consume(shutdown).instrument(span).await
    }

    async fn consume<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        tracing::info!(concurrency = self.concurrency, "worker started");

        loop {
            while let Some(done) = tasks.try_join_next() {
                log_panic(done);
            }

            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = match self.queue().receive().await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(self.idle_poll) => continue,
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "receive failed");
                    tokio::time::sleep(self.idle_poll).await;
                    continue;
                }
            };

            let worker = self.clone();
            tasks.spawn(
                async move {
                    let _permit = permit;
                    if let Err(e) = worker.handle(delivery).await {
                        tracing::warn!(error = %e, "delivery not acknowledged");
                    }
                }
                .in_current_span(),
            );
        }

        tracing::info!(in_flight = tasks.len(), "shutting down");
        while let Some(done) = tasks.join_next().await {
            log_panic(done);
        }
        Ok(())
    }

    /// Runs until `queue` holds nothing ready, delayed or in flight.
    pub async fn drain(&self, queue: &MemoryQueue) -> Result<StatsSnapshot> {
        self.run(queue.wait_until_empty(self.idle_poll)).await?;
        Ok(self.stats.snapshot())
    }
}

fn log_panic(done: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        tracing::error!(error = %e, "delivery task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::error::EngineError;
    use crate::queue::OutboundMessage;
    use crate::state_machine::{Job, Phase, RetryConfig};
    use crate::store::{MarkerKey, MarkerStore, read_markers};
    use crate::testing::{Fixture, START};

    fn worker_over(fx: Fixture, queue: Arc<dyn JobQueue>) -> (Worker, Fixture) {
        let engine = StepEngine::new(fx.collaborators()).with_poll_delay(Duration::from_secs(5));
        let publisher = Publisher::new(
            queue,
            RetryConfig {
                max_retries: 1,
                base_delay_ms: 1,
            },
        );
        (Worker::new(Arc::new(engine), publisher).with_concurrency(4), fx)
    }

    /// Accepts receive and ack, rejects every publish.
    struct ReadOnlyQueue(MemoryQueue);

    #[async_trait]
    impl JobQueue for ReadOnlyQueue {
        async fn publish(&self, _batch: &[OutboundMessage]) -> Result<()> {
            Err(EngineError::Queue("publish rejected".into()))
        }

        async fn receive(&self) -> Result<Option<Delivery>> {
            self.0.receive().await
        }

        async fn ack(&self, delivery_id: u64) -> Result<()> {
            self.0.ack(delivery_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drains_a_full_run_to_success() {
        let fx = Fixture::new()
            .with_modules(Phase::Recommendation, &["rightsizing", "idle_volumes"])
            .with_modules(Phase::Archive, &["snapshots"])
            .with_modules(Phase::Service, &["budget_sync", "tagging", "reports"]);
        fx.executor.fail_module("tagging", "token expired");
        let queue = Arc::new(MemoryQueue::new());
        let (worker, fx) = worker_over(fx, queue.clone());

        queue.publish(&[OutboundMessage::new(fx.root_job())]).await.unwrap();
        let stats = worker.drain(&queue).await.unwrap();

        assert_eq!(stats.runs_succeeded, 1);
        assert_eq!(stats.runs_failed, 0);
        assert_eq!(stats.modules_done, 6);
        assert_eq!(fx.executor.runs().len(), 6);

        let checklist = fx.checklists.get("chk-1").await.unwrap();
        assert_eq!(checklist.last_completed, START);
        assert!(checklist.is_idle());

        assert!(fx.results.get("org-1", START, Phase::Recommendation).await.is_some());
        assert!(fx.results.get("org-1", START, Phase::Archive).await.is_some());
        assert!(fx.results.get("org-1", START, Phase::Service).await.is_none());

        let prefix = MarkerKey::phase_prefix("org-1", START, Phase::Service);
        let service = read_markers(fx.markers.as_ref(), &prefix).await.unwrap();
        assert_eq!(service.len(), 3);
        let errors: Vec<_> = service
            .iter()
            .filter_map(|m| Some((m.module.as_str(), m.error.as_deref()?)))
            .collect();
        assert_eq!(errors, [("tagging", "token expired")]);
        assert!(fx.notifier.sent().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn child_timeout_fails_the_run_and_notifies() {
        let fx = Fixture::new().with_modules(Phase::Recommendation, &["slow"]);
        fx.executor.advance_clock_on_run(fx.root_job().task_timeout + 1);
        let queue = Arc::new(MemoryQueue::new());
        let (worker, fx) = worker_over(fx, queue.clone());

        queue.publish(&[OutboundMessage::new(fx.root_job())]).await.unwrap();
        let stats = worker.drain(&queue).await.unwrap();

        assert_eq!(stats.runs_failed, 1);
        assert_eq!(stats.runs_succeeded, 0);
        let sent = fx.notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].2["reason"].as_str().unwrap().starts_with("ChildTimeoutError - "));
        assert!(fx.checklists.get("chk-1").await.unwrap().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_fan_out_creates_children_once() {
        let fx = Fixture::new().with_modules(Phase::Recommendation, &["a", "b", "c"]);
        let queue = Arc::new(MemoryQueue::new());
        let (worker, fx) = worker_over(fx, queue.clone());

        let mut root = fx.root_job();
        root.state = State::Started;
        queue.publish(&[OutboundMessage::new(root.clone())]).await.unwrap();

        // First consumer publishes the children but dies before acknowledging.
        let first = queue.receive().await.unwrap().unwrap();
        let report = worker.engine.advance(first.job().unwrap()).await;
        queue.publish(&report.outbound).await.unwrap();
        assert_eq!(queue.redeliver_unacked().await, 1);

        let stats = worker.drain(&queue).await.unwrap();
        assert_eq!(fx.executor.runs().len(), 3);
        assert_eq!(stats.modules_done, 3);
        let prefix = MarkerKey::phase_prefix("org-1", START, Phase::Recommendation);
        assert_eq!(fx.markers.count(&prefix).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn malformed_message_is_acked_and_dropped() {
        let queue = Arc::new(MemoryQueue::new());
        let (worker, _fx) = worker_over(Fixture::new(), queue.clone());
        let job = Job::root("org-1", "chk-1", START, &Default::default());
        queue.publish(&[OutboundMessage::new(job)]).await.unwrap();

        let real = queue.receive().await.unwrap().unwrap();
        let delivery = Delivery {
            payload: "{not json".into(),
            ..real
        };
        worker.handle(delivery).await.unwrap();

        assert!(queue.is_empty().await);
        assert_eq!(worker.stats().snapshot().dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_leaves_delivery_unacked() {
        let inner = MemoryQueue::new();
        inner
            .publish(&[OutboundMessage::new(Fixture::new().root_job())])
            .await
            .unwrap();
        let queue = Arc::new(ReadOnlyQueue(inner));
        let (worker, _fx) = worker_over(Fixture::new(), queue.clone());

        let delivery = queue.receive().await.unwrap().unwrap();
        assert!(worker.handle(delivery).await.is_err());
        assert_eq!(queue.0.in_flight().await, 1);
        assert_eq!(worker.stats().snapshot().runs_succeeded, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_consuming() {
        let queue = Arc::new(MemoryQueue::new());
        let (worker, fx) = worker_over(Fixture::new(), queue.clone());
        queue.publish(&[OutboundMessage::new(fx.root_job())]).await.unwrap();

        worker.run(std::future::ready(())).await.unwrap();
        assert_eq!(worker.stats().snapshot().deliveries, 0);
        assert_eq!(queue.len().await, 1);
    }
}
