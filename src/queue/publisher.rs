use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use super::{JobQueue, OutboundMessage};
use crate::error::Result;
use crate::state_machine::RetryConfig;

/// Publishes batches, retrying transient queue failures with exponential backoff.
#[derive(Clone)]
pub struct Publisher {
    queue: Arc<dyn JobQueue>,
    retry: RetryConfig,
}

impl Publisher {
    pub fn new(queue: Arc<dyn JobQueue>, retry: RetryConfig) -> Self {
        Self { queue, retry }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Sends the batch, making at most `1 + max_retries` attempts.
    pub async fn publish(&self, batch: &[OutboundMessage]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            match self.queue.publish(batch).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay_ms = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        max = self.retry.max_retries,
                        delay_ms,
                        error = %e,
                        "publish failed, retrying"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::config::RunSettings;
    use crate::error::EngineError;
    use crate::queue::{Delivery, MemoryQueue};
    use crate::state_machine::Job;

    /// Fails the first `failures` publishes, then forwards to a memory queue.
    struct FlakyQueue {
        failures: AtomicU32,
        calls: AtomicU32,
        inner: MemoryQueue,
    }

    impl FlakyQueue {
        fn new(failures: u32) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                inner: MemoryQueue::new(),
            }
        }
    }

    #[async_trait]
    impl JobQueue for FlakyQueue {
        async fn publish(&self, batch: &[OutboundMessage]) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::Queue("broker unavailable".into()));
            }
            self.inner.publish(batch).await
        }

        async fn receive(&self) -> Result<Option<Delivery>> {
            self.inner.receive().await
        }

        async fn ack(&self, delivery_id: u64) -> Result<()> {
            self.inner.ack(delivery_id).await
        }
    }

    fn batch() -> Vec<OutboundMessage> {
        vec![OutboundMessage::new(Job::root("org", "chk", 1, &RunSettings::default()))]
    }

    fn retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let queue = Arc::new(FlakyQueue::new(2));
        let publisher = Publisher::new(queue.clone(), retry(3));

        publisher.publish(&batch()).await.unwrap();
        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.inner.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let queue = Arc::new(FlakyQueue::new(10));
        let publisher = Publisher::new(queue.clone(), retry(2));

        let err = publisher.publish(&batch()).await.unwrap_err();
        assert!(matches!(err, EngineError::Queue(_)));
        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let queue = Arc::new(FlakyQueue::new(10));
        let publisher = Publisher::new(queue.clone(), retry(2));
        publisher.publish(&[]).await.unwrap();
        assert_eq!(queue.calls.load(Ordering::SeqCst), 0);
    }
}
