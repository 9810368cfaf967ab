//! Backlot Result Store
//!
//! Owns the mutable half of a task's life: its state, the worker running it,
//! the terminal outcome and the revoke flag. Terminal records expire after a
//! TTL; expiry is enforced lazily on read and by [`ResultStore::purge_expired`].

use std::time::Duration;

use async_trait::async_trait;
use bl_common::{StateHistogram, TaskMessage, TaskOutcome, TaskRecord, TaskState};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryResultStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteResultStore;

#[derive(Error, Debug)]
pub enum ResultStoreError {
    #[error("Result store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} is not a terminal state")]
    NotTerminal(TaskState),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for ResultStoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                ResultStoreError::Unavailable(e.to_string())
            }
            other => ResultStoreError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ResultStoreError>;

/// Answer to a result query.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskLookup {
    /// The task reached SUCCESS, DEAD_LETTER or REVOKED.
    Complete(TaskRecord),
    /// Still in flight, or unknown / expired (`None`).
    NotComplete(Option<TaskRecord>),
}

impl TaskLookup {
    pub fn state(&self) -> TaskState {
        match self {
            TaskLookup::Complete(record) => record.state,
            TaskLookup::NotComplete(Some(record)) => record.state,
            TaskLookup::NotComplete(None) => TaskState::Pending,
        }
    }

    pub fn record(&self) -> Option<&TaskRecord> {
        match self {
            TaskLookup::Complete(record) | TaskLookup::NotComplete(Some(record)) => Some(record),
            TaskLookup::NotComplete(None) => None,
        }
    }

    fn from_record(record: Option<TaskRecord>) -> Self {
        match record {
            Some(record) if record.state.is_terminal() => TaskLookup::Complete(record),
            other => TaskLookup::NotComplete(other),
        }
    }
}

/// What a worker should do with a delivery it just received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// Record moved to STARTED; run the handler.
    Proceed,
    /// A revoke was requested before execution began.
    Revoked,
    /// A previous delivery already wrote a terminal outcome; settle the broker side only.
    AlreadyFinished(TaskState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Flagged,
    AlreadyStarted,
    AlreadyTerminal(TaskState),
    NotFound,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create a PENDING record unless one already exists.
    async fn record_pending(&self, message: &TaskMessage) -> Result<()>;

    /// Atomically check the revoke flag and move to STARTED.
    async fn mark_started(&self, message: &TaskMessage, worker_id: &str) -> Result<StartDecision>;

    /// Record a failed attempt (transient failure or timeout).
    async fn record_failure(&self, id: Uuid, retries: u32, error: &str) -> Result<()>;

    /// Record that the task will run again with `retries` prior attempts.
    async fn record_retry(&self, id: Uuid, retries: u32, error: &str) -> Result<()>;

    /// Write a terminal outcome, replacing every outcome field of any earlier write.
    async fn put(&self, id: Uuid, outcome: &TaskOutcome, ttl: Duration) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<TaskLookup>;

    /// Flag a not-yet-started task so the worker skips it.
    async fn request_revoke(&self, id: Uuid) -> Result<RevokeOutcome>;

    async fn is_revoked(&self, id: Uuid) -> Result<bool>;

    /// Record counts per state, for records touched since `since`.
    async fn state_histogram(&self, since: DateTime<Utc>) -> Result<StateHistogram>;

    /// Delete expired records. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

pub(crate) fn ensure_terminal(outcome: &TaskOutcome) -> Result<()> {
    if outcome.state.is_terminal() {
        Ok(())
    } else {
        Err(ResultStoreError::NotTerminal(outcome.state))
    }
}

pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
