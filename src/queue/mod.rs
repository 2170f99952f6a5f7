//! Job transport. Delivery is at-least-once with manual acknowledgement; payloads
//! travel as JSON.

mod memory;
mod publisher;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::state_machine::Job;

pub use memory::MemoryQueue;
pub use publisher::Publisher;

/// A job to enqueue, with optional producer-side de-duplication and delayed
/// visibility.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub job: Job,
    /// Messages sharing a key are enqueued at most once.
    pub dedup_key: Option<String>,
    pub delay: Option<Duration>,
}

impl OutboundMessage {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            dedup_key: None,
            delay: None,
        }
    }

    /// De-duplicated on the job's deterministic key. Used for fan-out so a
    /// redelivered fan-out step does not create its children twice.
    pub fn unique(job: Job) -> Self {
        let key = job.job_key();
        Self {
            job,
            dedup_key: Some(key),
            delay: None,
        }
    }

    pub fn delayed(job: Job, delay: Duration) -> Self {
        Self {
            job,
            dedup_key: None,
            delay: (!delay.is_zero()).then_some(delay),
        }
    }
}

/// One received, not yet acknowledged message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: u64,
    pub payload: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn job(&self) -> Result<Job> {
        serde_json::from_str(&self.payload).map_err(|e| EngineError::MalformedJob(e.to_string()))
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues the whole batch.
    async fn publish(&self, batch: &[OutboundMessage]) -> Result<()>;

    /// Takes the next visible message, if any, without blocking.
    async fn receive(&self) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery_id: u64) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunSettings;

    #[test]
    fn unique_message_uses_job_key() {
        let root = Job::root("org", "chk", 7, &RunSettings::default());
        let child = root.child("tagging", crate::state_machine::Phase::Service, 8);
        let msg = OutboundMessage::unique(child);
        assert_eq!(msg.dedup_key.as_deref(), Some("org/7/service/tagging"));
    }

    #[test]
    fn zero_delay_is_immediate() {
        let root = Job::root("org", "chk", 7, &RunSettings::default());
        assert_eq!(OutboundMessage::delayed(root.clone(), Duration::ZERO).delay, None);
        assert_eq!(
            OutboundMessage::delayed(root, Duration::from_millis(5)).delay,
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn malformed_payload_is_reported() {
        let delivery = Delivery {
            id: 1,
            payload: "{\"state\": 3}".into(),
            attempt: 1,
        };
        assert!(matches!(delivery.job(), Err(EngineError::MalformedJob(_))));
    }
}
