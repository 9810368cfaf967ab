use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bl_common::{DeadLetter, Delivery, QueueDepth, TaskMessage, WorkerRecord};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{Broker, BrokerError, Result, WorkerRegistry};

/// Candidates examined per claim attempt when racing other consumers.
const CLAIM_CANDIDATES: i64 = 8;

/// Open (and create if missing) a SQLite database in WAL mode.
pub async fn connect_sqlite(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

fn to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// SQLite-backed broker. Timestamps are stored as epoch milliseconds.
pub struct SqliteBroker {
    pool: SqlitePool,
    visibility_timeout: Duration,
    poll_interval: Duration,
    running: AtomicBool,
    activity: Notify,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval,
            running: AtomicBool::new(true),
            activity: Notify::new(),
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_queue (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                receipt_handle TEXT,
                receive_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_task_queue_visible ON task_queue (queue, visible_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_task_queue_receipt ON task_queue (receipt_handle)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                reason TEXT NOT NULL,
                dead_lettered_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_queue ON dead_letters (queue, dead_lettered_at)",
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite broker schema initialized");
        Ok(())
    }

    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pool.close().await;
    }

    /// Park a row whose payload cannot be decoded so it stops blocking the queue.
    async fn quarantine(&self, id: &str, queue: &str, payload: &str, error: &serde_json::Error) -> Result<()> {
        warn!(task_id = %id, queue = %queue, error = %error, "Malformed task payload, dead-lettering");

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO dead_letters (id, queue, payload, reason, dead_lettered_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(queue)
        .bind(payload)
        .bind(format!("malformed payload: {}", error))
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM task_queue WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        metrics::counter!("backlot.broker.dead_lettered_total", "queue" => queue.to_string()).increment(1);
        Ok(())
    }

    async fn release(&self, receipt_handle: &str, delay: Duration, payload: Option<String>) -> Result<()> {
        let visible_at = Utc::now().timestamp_millis().saturating_add(millis(delay));

        let result = match payload {
            Some(payload) => {
                sqlx::query(
                    "UPDATE task_queue SET visible_at = ?, receipt_handle = NULL, payload = ? WHERE receipt_handle = ?",
                )
                .bind(visible_at)
                .bind(payload)
                .bind(receipt_handle)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE task_queue SET visible_at = ?, receipt_handle = NULL WHERE receipt_handle = ?",
                )
                .bind(visible_at)
                .bind(receipt_handle)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, "NACK failed - receipt no longer current");
            return Err(BrokerError::NotFound(receipt_handle.to_string()));
        }

        if delay.is_zero() {
            self.activity.notify_waiters();
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn enqueue(&self, message: &TaskMessage) -> Result<Uuid> {
        let now = Utc::now().timestamp_millis();
        let visible_at = message
            .eta
            .map(|eta| eta.timestamp_millis().max(now))
            .unwrap_or(now);
        let payload = serde_json::to_string(message)?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO task_queue (id, queue, payload, visible_at, enqueued_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.id.to_string())
        .bind(&message.queue)
        .bind(&payload)
        .bind(visible_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(task_id = %message.id, queue = %message.queue, "Duplicate enqueue ignored");
            return Ok(message.id);
        }

        metrics::counter!("backlot.broker.enqueued_total", "queue" => message.queue.clone()).increment(1);
        debug!(task_id = %message.id, queue = %message.queue, "Task enqueued");
        self.activity.notify_waiters();
        Ok(message.id)
    }

    async fn try_dequeue(&self, queue: &str) -> Result<Option<Delivery>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker closed".to_string()));
        }

        let now = Utc::now().timestamp_millis();
        let invisible_until = now.saturating_add(millis(self.visibility_timeout));

        let rows = sqlx::query(
            r#"
            SELECT id, payload, receive_count
            FROM task_queue
            WHERE queue = ? AND visible_at <= ?
            ORDER BY enqueued_at, rowid
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(now)
        .bind(CLAIM_CANDIDATES)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let id: String = row.get("id");
            let payload: String = row.get("payload");
            let receive_count: i64 = row.get("receive_count");
            let receipt_handle = Uuid::new_v4().to_string();

            // Conditional on visibility so only one consumer wins the row
            let claimed = sqlx::query(
                r#"
                UPDATE task_queue
                SET receipt_handle = ?, visible_at = ?, receive_count = receive_count + 1
                WHERE id = ? AND visible_at <= ?
                "#,
            )
            .bind(&receipt_handle)
            .bind(invisible_until)
            .bind(&id)
            .bind(now)
            .execute(&self.pool)
            .await?;

            if claimed.rows_affected() == 0 {
                continue;
            }

            let message: TaskMessage = match serde_json::from_str(&payload) {
                Ok(message) => message,
                Err(e) => {
                    self.quarantine(&id, queue, &payload, &e).await?;
                    continue;
                }
            };

            let receive_count = u32::try_from(receive_count + 1).unwrap_or(u32::MAX);
            if receive_count > 1 {
                debug!(task_id = %id, queue = %queue, receive_count, "Redelivering task");
            }

            return Ok(Some(Delivery {
                message,
                receipt_handle,
                queue: queue.to_string(),
                receive_count,
            }));
        }

        Ok(None)
    }

    async fn wait_for_activity(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.activity.notified()).await;
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM task_queue WHERE receipt_handle = ?")
            .bind(receipt_handle)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, "ACK failed - receipt no longer current");
            return Err(BrokerError::NotFound(receipt_handle.to_string()));
        }

        debug!(receipt_handle = %receipt_handle, "Task acknowledged");
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay: Duration) -> Result<()> {
        self.release(receipt_handle, delay, None).await
    }

    async fn retry(&self, receipt_handle: &str, message: &TaskMessage, delay: Duration) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.release(receipt_handle, delay, Some(payload)).await
    }

    async fn extend_visibility(&self, receipt_handle: &str, period: Duration) -> Result<()> {
        let visible_at = Utc::now().timestamp_millis().saturating_add(millis(period));

        let result = sqlx::query("UPDATE task_queue SET visible_at = ? WHERE receipt_handle = ?")
            .bind(visible_at)
            .bind(receipt_handle)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(receipt_handle = %receipt_handle, "Extend visibility failed - receipt no longer current");
            return Err(BrokerError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn dead_letter(&self, receipt_handle: &str, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT id, queue, payload FROM task_queue WHERE receipt_handle = ?")
            .bind(receipt_handle)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            warn!(receipt_handle = %receipt_handle, "Dead-letter failed - receipt no longer current");
            return Err(BrokerError::NotFound(receipt_handle.to_string()));
        };

        let id: String = row.get("id");
        let queue: String = row.get("queue");
        let payload: String = row.get("payload");

        sqlx::query(
            "INSERT OR REPLACE INTO dead_letters (id, queue, payload, reason, dead_lettered_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&queue)
        .bind(&payload)
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM task_queue WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        metrics::counter!("backlot.broker.dead_lettered_total", "queue" => queue.clone()).increment(1);
        info!(task_id = %id, queue = %queue, reason = %reason, "Task dead-lettered");
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN visible_at <= ? THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN visible_at > ? AND receipt_handle IS NULL THEN 1 ELSE 0 END), 0) AS delayed,
                COALESCE(SUM(CASE WHEN visible_at > ? AND receipt_handle IS NOT NULL THEN 1 ELSE 0 END), 0) AS in_flight
            FROM task_queue
            WHERE queue = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;

        let dead_row = sqlx::query("SELECT COUNT(*) AS count FROM dead_letters WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;

        let pending: i64 = row.get("pending");
        let delayed: i64 = row.get("delayed");
        let in_flight: i64 = row.get("in_flight");
        let dead_letter: i64 = dead_row.get("count");

        Ok(QueueDepth {
            queue: queue.to_string(),
            pending: pending as u64,
            delayed: delayed as u64,
            in_flight: in_flight as u64,
            dead_letter: dead_letter as u64,
        })
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT queue FROM task_queue UNION SELECT DISTINCT queue FROM dead_letters ORDER BY 1",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT payload, reason, dead_lettered_at
            FROM dead_letters
            WHERE queue = ?
            ORDER BY dead_lettered_at DESC
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut letters = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get("payload");
            let message: TaskMessage = match serde_json::from_str(&payload) {
                Ok(message) => message,
                Err(e) => {
                    debug!(queue = %queue, error = %e, "Skipping undecodable dead letter");
                    continue;
                }
            };
            letters.push(DeadLetter {
                message,
                reason: row.get("reason"),
                dead_lettered_at: to_datetime(row.get("dead_lettered_at")),
            });
        }
        Ok(letters)
    }

    async fn purge_dead_letters(&self, queue: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE queue = ?")
            .bind(queue)
            .execute(&self.pool)
            .await?;

        info!(queue = %queue, purged = result.rows_affected(), "Dead letters purged");
        Ok(result.rows_affected())
    }

    fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.pool.is_closed()
    }
}

/// Worker heartbeats stored next to the queues.
pub struct SqliteWorkerRegistry {
    pool: SqlitePool,
}

impl SqliteWorkerRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                last_heartbeat INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerRegistry for SqliteWorkerRegistry {
    async fn heartbeat(&self, record: &WorkerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workers (id, payload, last_heartbeat) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&record.id)
        .bind(serde_json::to_string(record)?)
        .bind(record.last_heartbeat.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query("SELECT payload FROM workers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload).map_err(BrokerError::from)
            })
            .collect()
    }

    async fn reap_stale(&self, threshold: Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now().timestamp_millis().saturating_sub(millis(threshold));

        let rows = sqlx::query("DELETE FROM workers WHERE last_heartbeat < ? RETURNING id")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        let reaped: Vec<String> = rows.iter().map(|row| row.get("id")).collect();
        for id in &reaped {
            info!(worker_id = %id, "Reaped stale worker");
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker() -> SqliteBroker {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let broker = SqliteBroker::new(pool, Duration::from_secs(30), Duration::from_millis(10));
        broker.init_schema().await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_malformed_payload_is_quarantined() {
        let broker = broker().await;
        let now = Utc::now().timestamp_millis();
        sqlx::query("INSERT INTO task_queue (id, queue, payload, visible_at, enqueued_at) VALUES ('bad', 'default', '{not json', ?, ?)")
            .bind(now)
            .bind(now)
            .execute(&broker.pool)
            .await
            .unwrap();

        assert!(broker.try_dequeue("default").await.unwrap().is_none());

        let depth = broker.depth("default").await.unwrap();
        assert_eq!(depth.pending, 0);
        assert_eq!(depth.dead_letter, 1);
    }

    #[tokio::test]
    async fn test_eta_in_future_is_delayed() {
        let broker = broker().await;
        let message = TaskMessage::new("t", "default").with_eta(Utc::now() + chrono::Duration::hours(1));
        broker.enqueue(&message).await.unwrap();

        assert!(broker.try_dequeue("default").await.unwrap().is_none());
        let depth = broker.depth("default").await.unwrap();
        assert_eq!(depth.delayed, 1);
        assert_eq!(depth.pending, 0);
    }

    #[tokio::test]
    async fn test_closed_broker_is_unavailable() {
        let broker = broker().await;
        broker.close().await;
        assert!(!broker.is_healthy());
        let err = broker.try_dequeue("default").await.unwrap_err();
        assert!(err.is_unavailable());
    }
}
