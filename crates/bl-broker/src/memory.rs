//! In-process broker for tests and single-process development.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bl_common::{DeadLetter, Delivery, QueueDepth, TaskMessage, WorkerRecord};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{after, Broker, BrokerError, Result, WorkerRegistry};

struct Entry {
    message: TaskMessage,
    seq: u64,
    visible_at: DateTime<Utc>,
    receipt_handle: Option<String>,
    receive_count: u32,
}

#[derive(Default)]
struct State {
    entries: HashMap<Uuid, Entry>,
    receipts: HashMap<String, Uuid>,
    dead_letters: HashMap<String, Vec<DeadLetter>>,
    known_queues: BTreeSet<String>,
    next_seq: u64,
}

impl State {
    fn claimed_id(&self, receipt_handle: &str) -> Result<Uuid> {
        self.receipts
            .get(receipt_handle)
            .copied()
            .ok_or_else(|| BrokerError::NotFound(receipt_handle.to_string()))
    }
}

pub struct MemoryBroker {
    state: Mutex<State>,
    visibility_timeout: Duration,
    poll_interval: Duration,
    activity: Notify,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self::with_poll_interval(visibility_timeout, Duration::from_millis(50))
    }

    pub fn with_poll_interval(visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            visibility_timeout,
            poll_interval,
            activity: Notify::new(),
        }
    }

    fn release(&self, receipt_handle: &str, delay: Duration, replacement: Option<&TaskMessage>) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.claimed_id(receipt_handle)?;
        state.receipts.remove(receipt_handle);

        let entry = state
            .entries
            .get_mut(&id)
            .ok_or_else(|| BrokerError::NotFound(receipt_handle.to_string()))?;
        entry.receipt_handle = None;
        entry.visible_at = after(Utc::now(), delay);
        if let Some(message) = replacement {
            entry.message = message.clone();
        }
        drop(state);

        if delay.is_zero() {
            self.activity.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, message: &TaskMessage) -> Result<Uuid> {
        let mut state = self.state.lock();
        if state.entries.contains_key(&message.id) {
            debug!(task_id = %message.id, "Duplicate enqueue ignored");
            return Ok(message.id);
        }

        let now = Utc::now();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.known_queues.insert(message.queue.clone());
        state.entries.insert(
            message.id,
            Entry {
                message: message.clone(),
                seq,
                visible_at: message.eta.map(|eta| eta.max(now)).unwrap_or(now),
                receipt_handle: None,
                receive_count: 0,
            },
        );
        drop(state);

        metrics::counter!("backlot.broker.enqueued_total", "queue" => message.queue.clone()).increment(1);
        self.activity.notify_waiters();
        Ok(message.id)
    }

    async fn try_dequeue(&self, queue: &str) -> Result<Option<Delivery>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let next = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.message.queue == queue && entry.visible_at <= now)
            .min_by_key(|(_, entry)| entry.seq)
            .map(|(id, _)| *id);

        let Some(id) = next else {
            return Ok(None);
        };

        let receipt_handle = Uuid::new_v4().to_string();

        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(None);
        };
        let stale_receipt = entry.receipt_handle.replace(receipt_handle.clone());
        entry.visible_at = after(now, self.visibility_timeout);
        entry.receive_count += 1;

        let delivery = Delivery {
            message: entry.message.clone(),
            receipt_handle: receipt_handle.clone(),
            queue: queue.to_string(),
            receive_count: entry.receive_count,
        };

        if let Some(stale) = stale_receipt {
            state.receipts.remove(&stale);
        }
        state.receipts.insert(receipt_handle, id);

        Ok(Some(delivery))
    }

    async fn wait_for_activity(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.activity.notified()).await;
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.claimed_id(receipt_handle).inspect_err(|_| {
            warn!(receipt_handle = %receipt_handle, "ACK failed - receipt no longer current");
        })?;
        state.receipts.remove(receipt_handle);
        state.entries.remove(&id);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay: Duration) -> Result<()> {
        self.release(receipt_handle, delay, None)
    }

    async fn retry(&self, receipt_handle: &str, message: &TaskMessage, delay: Duration) -> Result<()> {
        self.release(receipt_handle, delay, Some(message))
    }

    async fn extend_visibility(&self, receipt_handle: &str, period: Duration) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.claimed_id(receipt_handle)?;
        if let Some(entry) = state.entries.get_mut(&id) {
            entry.visible_at = after(Utc::now(), period);
        }
        Ok(())
    }

    async fn dead_letter(&self, receipt_handle: &str, reason: &str) -> Result<()> {
        let mut state = self.state.lock();
        let id = state.claimed_id(receipt_handle)?;
        state.receipts.remove(receipt_handle);

        let Some(entry) = state.entries.remove(&id) else {
            return Err(BrokerError::NotFound(receipt_handle.to_string()));
        };

        let queue = entry.message.queue.clone();
        let letters = state.dead_letters.entry(queue.clone()).or_default();
        letters.retain(|letter| letter.message.id != id);
        letters.push(DeadLetter {
            message: entry.message,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        drop(state);

        metrics::counter!("backlot.broker.dead_lettered_total", "queue" => queue.clone()).increment(1);
        info!(task_id = %id, queue = %queue, reason = %reason, "Task dead-lettered");
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let now = Utc::now();
        let state = self.state.lock();
        let mut depth = QueueDepth {
            queue: queue.to_string(),
            ..Default::default()
        };

        for entry in state.entries.values().filter(|e| e.message.queue == queue) {
            if entry.visible_at <= now {
                depth.pending += 1;
            } else if entry.receipt_handle.is_some() {
                depth.in_flight += 1;
            } else {
                depth.delayed += 1;
            }
        }
        depth.dead_letter = state.dead_letters.get(queue).map_or(0, |d| d.len() as u64);
        Ok(depth)
    }

    async fn queues(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().known_queues.iter().cloned().collect())
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.lock();
        Ok(state
            .dead_letters
            .get(queue)
            .map(|letters| letters.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn purge_dead_letters(&self, queue: &str) -> Result<u64> {
        let purged = self
            .state
            .lock()
            .dead_letters
            .remove(queue)
            .map_or(0, |letters| letters.len() as u64);
        info!(queue = %queue, purged, "Dead letters purged");
        Ok(purged)
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct MemoryWorkerRegistry {
    workers: DashMap<String, WorkerRecord>,
}

impl MemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerRegistry for MemoryWorkerRegistry {
    async fn heartbeat(&self, record: &WorkerRecord) -> Result<()> {
        self.workers.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<()> {
        self.workers.remove(worker_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>> {
        let mut workers: Vec<WorkerRecord> = self.workers.iter().map(|w| w.value().clone()).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn reap_stale(&self, threshold: Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|w| w.value().is_stale(now, threshold))
            .map(|w| w.key().clone())
            .collect();

        for id in &stale {
            self.workers.remove(id);
            info!(worker_id = %id, "Reaped stale worker");
        }
        Ok(stale)
    }
}
