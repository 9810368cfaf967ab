use std::time::Duration;

use async_trait::async_trait;
use bl_common::{DeadLetter, Delivery, QueueDepth, TaskMessage, WorkerRecord};
use uuid::Uuid;

pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::BrokerError;
pub use memory::{MemoryBroker, MemoryWorkerRegistry};

#[cfg(feature = "sqlite")]
pub use sqlite::{connect_sqlite, SqliteBroker, SqliteWorkerRegistry};

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Durable per-queue FIFO store with visibility timeouts.
///
/// A dequeued message stays invisible for the visibility period. If the holder
/// neither acks nor nacks it in time the broker hands it out again, which is
/// what makes delivery at-least-once.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a message. Enqueueing an id that is already stored is a no-op.
    async fn enqueue(&self, message: &TaskMessage) -> Result<Uuid>;

    /// Claim the oldest visible message without waiting.
    async fn try_dequeue(&self, queue: &str) -> Result<Option<Delivery>>;

    /// Claim the oldest visible message, waiting up to `wait` for one to appear.
    async fn dequeue(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_dequeue(queue).await? {
                return Ok(Some(delivery));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.wait_for_activity(self.poll_interval().min(deadline - now)).await;
        }
    }

    /// Park a blocked dequeue. Backends that can signal new work wake early.
    async fn wait_for_activity(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }

    /// Remove the message for good.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Release the claim; the message becomes visible again after `delay`.
    async fn nack(&self, receipt_handle: &str, delay: Duration) -> Result<()>;

    /// Release the claim and replace the stored message (next attempt).
    async fn retry(&self, receipt_handle: &str, message: &TaskMessage, delay: Duration) -> Result<()>;

    /// Push the visibility deadline to `now + period`.
    async fn extend_visibility(&self, receipt_handle: &str, period: Duration) -> Result<()>;

    /// Move the message to its queue's dead-letter set. Never redelivered.
    async fn dead_letter(&self, receipt_handle: &str, reason: &str) -> Result<()>;

    async fn depth(&self, queue: &str) -> Result<QueueDepth>;

    /// Queues that currently hold messages or dead letters.
    async fn queues(&self) -> Result<Vec<String>>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>>;

    async fn purge_dead_letters(&self, queue: &str) -> Result<u64>;

    fn visibility_timeout(&self) -> Duration;

    fn poll_interval(&self) -> Duration;

    fn is_healthy(&self) -> bool;
}

/// Where workers publish heartbeats.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Insert or refresh the record.
    async fn heartbeat(&self, record: &WorkerRecord) -> Result<()>;

    async fn deregister(&self, worker_id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<WorkerRecord>>;

    /// Delete records whose last heartbeat is older than `threshold`. Returns their ids.
    async fn reap_stale(&self, threshold: Duration) -> Result<Vec<String>>;
}

/// `now + duration`, clamped instead of overflowing.
pub(crate) fn after(now: chrono::DateTime<chrono::Utc>, duration: Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}
