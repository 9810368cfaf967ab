use std::time::Duration;

use async_trait::async_trait;
use bl_common::{StateHistogram, TaskMessage, TaskOutcome, TaskRecord, TaskState};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::{ensure_terminal, expiry, Result, ResultStore, RevokeOutcome, StartDecision, TaskLookup};

/// Process-local result store. Per-key atomicity comes from the DashMap shard locks.
#[derive(Default)]
pub struct MemoryResultStore {
    records: DashMap<Uuid, TaskRecord>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Live (unexpired) record, dropping it if it has expired.
    fn live(&self, id: Uuid, now: DateTime<Utc>) -> Option<TaskRecord> {
        let record = self.records.get(&id).map(|r| r.value().clone())?;
        if record.is_expired(now) {
            self.records.remove_if(&id, |_, r| r.is_expired(now));
            debug!(task_id = %id, "Dropped expired result on read");
            return None;
        }
        Some(record)
    }

    fn update(&self, id: Uuid, apply: impl FnOnce(&mut TaskRecord)) {
        if let Some(mut record) = self.records.get_mut(&id) {
            apply(record.value_mut());
        }
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn record_pending(&self, message: &TaskMessage) -> Result<()> {
        let now = Utc::now();
        match self.records.entry(message.id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(TaskRecord::pending(message, now));
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(TaskRecord::pending(message, now));
            }
        }
        Ok(())
    }

    async fn mark_started(&self, message: &TaskMessage, worker_id: &str) -> Result<StartDecision> {
        let now = Utc::now();
        let mut entry = self
            .records
            .entry(message.id)
            .or_insert_with(|| TaskRecord::pending(message, now));
        let record = entry.value_mut();

        if record.is_expired(now) {
            *record = TaskRecord::pending(message, now);
        }
        if record.revoke_requested {
            return Ok(StartDecision::Revoked);
        }
        if record.state.is_terminal() {
            return Ok(StartDecision::AlreadyFinished(record.state));
        }

        record.state = TaskState::Started;
        record.worker_id = Some(worker_id.to_string());
        record.retries = message.retries;
        record.started_at = Some(now);
        record.updated_at = now;
        Ok(StartDecision::Proceed)
    }

    async fn record_failure(&self, id: Uuid, retries: u32, error: &str) -> Result<()> {
        self.update(id, |record| {
            record.state = TaskState::Failure;
            record.retries = retries;
            record.error = Some(error.to_string());
            record.updated_at = Utc::now();
        });
        Ok(())
    }

    async fn record_retry(&self, id: Uuid, retries: u32, error: &str) -> Result<()> {
        self.update(id, |record| {
            record.state = TaskState::Retry;
            record.retries = retries;
            record.error = Some(error.to_string());
            record.worker_id = None;
            record.updated_at = Utc::now();
        });
        Ok(())
    }

    async fn put(&self, id: Uuid, outcome: &TaskOutcome, ttl: Duration) -> Result<()> {
        ensure_terminal(outcome)?;
        let now = Utc::now();

        let mut entry = self.records.entry(id).or_insert_with(|| TaskRecord {
            id,
            task_name: String::new(),
            queue: String::new(),
            state: outcome.state,
            retries: 0,
            result: None,
            error: None,
            worker_id: None,
            revoke_requested: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            expires_at: None,
        });
        let record = entry.value_mut();
        record.state = outcome.state;
        record.result = outcome.result.clone();
        record.error = outcome.error.clone();
        record.retries = outcome.retries;
        record.worker_id = outcome.worker_id.clone();
        record.finished_at = Some(now);
        record.updated_at = now;
        record.expires_at = Some(expiry(now, ttl));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<TaskLookup> {
        Ok(TaskLookup::from_record(self.live(id, Utc::now())))
    }

    async fn request_revoke(&self, id: Uuid) -> Result<RevokeOutcome> {
        let now = Utc::now();
        let Some(mut record) = self.records.get_mut(&id) else {
            return Ok(RevokeOutcome::NotFound);
        };
        let record = record.value_mut();

        if record.is_expired(now) {
            return Ok(RevokeOutcome::NotFound);
        }
        if record.state.is_terminal() {
            return Ok(RevokeOutcome::AlreadyTerminal(record.state));
        }
        if !record.state.is_revocable() {
            return Ok(RevokeOutcome::AlreadyStarted);
        }

        record.revoke_requested = true;
        record.updated_at = now;
        Ok(RevokeOutcome::Flagged)
    }

    async fn is_revoked(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .live(id, Utc::now())
            .is_some_and(|record| record.revoke_requested || record.state == TaskState::Revoked))
    }

    async fn state_histogram(&self, since: DateTime<Utc>) -> Result<StateHistogram> {
        let now = Utc::now();
        let mut histogram = StateHistogram::new();
        for record in self.records.iter() {
            if record.updated_at >= since && !record.is_expired(now) {
                *histogram.entry(record.state).or_insert(0) += 1;
            }
        }
        Ok(histogram)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
