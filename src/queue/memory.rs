use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Delivery, JobQueue, OutboundMessage};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
struct Queued {
    payload: String,
    attempt: u32,
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<Queued>,
    delayed: Vec<(Instant, Queued)>,
    in_flight: HashMap<u64, Queued>,
    seen: HashSet<String>,
    /// De-duplication keys by first publish, oldest first.
    seen_order: VecDeque<(Instant, String)>,
    next_id: u64,
}

impl Inner {
    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|(visible_at, _)| *visible_at <= now);
        self.delayed = pending;
        let mut due = due;
        due.sort_by_key(|(visible_at, _)| *visible_at);
        self.ready.extend(due.into_iter().map(|(_, queued)| queued));
    }

    /// Records `key` unless it was already published within `window`. Keys older
    /// than the window are forgotten first.
    fn remember(&mut self, key: &str, now: Instant, window: Duration) -> bool {
        while self
            .seen_order
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= window)
        {
            if let Some((_, expired)) = self.seen_order.pop_front() {
                self.seen.remove(&expired);
            }
        }
        if !self.seen.insert(key.to_string()) {
            return false;
        }
        self.seen_order.push_back((now, key.to_string()));
        true
    }
}

/// How long a de-duplication key suppresses repeats by default.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// In-process queue with delayed visibility, producer de-duplication and manual
/// acknowledgement. Unacknowledged messages can be put back with
/// [`MemoryQueue::redeliver_unacked`]. A de-duplication key is remembered for the
/// de-dup window only, so the key set stays bounded.
#[derive(Debug)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    dedup_window: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self {
            inner: Mutex::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Makes every in-flight message visible again, as a broker does when a
    /// consumer dies before acknowledging.
    pub async fn redeliver_unacked(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let mut ids: Vec<_> = inner.in_flight.keys().copied().collect();
        ids.sort_unstable();
        let count = ids.len();
        for id in ids {
            if let Some(mut queued) = inner.in_flight.remove(&id) {
                queued.attempt += 1;
                inner.ready.push_back(queued);
            }
        }
        count
    }

    /// Messages ready, delayed and in flight.
    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.ready.len() + inner.delayed.len() + inner.in_flight.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resolves once nothing is ready, delayed or in flight, checking every `poll`.
    pub async fn wait_until_empty(&self, poll: Duration) {
        while !self.is_empty().await {
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Time until the earliest delayed message becomes visible.
    pub async fn next_visible_in(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        inner
            .delayed
            .iter()
            .map(|(visible_at, _)| visible_at.saturating_duration_since(now))
            .min()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish(&self, batch: &[OutboundMessage]) -> Result<()> {
        let payloads = batch
            .iter()
            .map(|msg| serde_json::to_string(&msg.job))
            .collect::<Result<Vec<_>, _>>()?;

        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        for (msg, payload) in batch.iter().zip(payloads) {
            if let Some(key) = &msg.dedup_key
                && !inner.remember(key, now, self.dedup_window)
            {
                tracing::debug!(%key, "duplicate message dropped by producer");
                continue;
            }
            let queued = Queued {
                payload,
                attempt: 1,
            };
            match msg.delay {
                Some(delay) => inner.delayed.push((now + delay, queued)),
                None => inner.ready.push_back(queued),
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut inner = self.inner.lock().await;
        inner.promote_due(Instant::now());
        let Some(queued) = inner.ready.pop_front() else {
            return Ok(None);
        };
        inner.next_id += 1;
        let id = inner.next_id;
        let delivery = Delivery {
            id,
            payload: queued.payload.clone(),
            attempt: queued.attempt,
        };
        inner.in_flight.insert(id, queued);
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_id: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .in_flight
            .remove(&delivery_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::Queue(format!("unknown delivery {delivery_id}")))
    }
}
