use std::time::Duration;

use async_trait::async_trait;
use bl_common::{StateHistogram, TaskMessage, TaskOutcome, TaskRecord, TaskState};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    ensure_terminal, expiry, Result, ResultStore, ResultStoreError, RevokeOutcome, StartDecision,
    TaskLookup,
};

const TERMINAL_STATES: &str = "('SUCCESS', 'DEAD_LETTER', 'REVOKED')";

fn to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

fn decode(row: &SqliteRow) -> Result<TaskRecord> {
    let id: String = row.get("id");
    let corrupt = |reason: String| ResultStoreError::Corrupt {
        id: id.clone(),
        reason,
    };

    let parsed_id = Uuid::parse_str(&id).map_err(|e| corrupt(e.to_string()))?;
    let state: String = row.get("state");
    let state: TaskState = state.parse().map_err(corrupt)?;
    let result: Option<String> = row.get("result");
    let result = result.map(|raw| serde_json::from_str(&raw)).transpose()?;
    let retries: i64 = row.get("retries");
    let revoke_requested: i64 = row.get("revoke_requested");

    Ok(TaskRecord {
        id: parsed_id,
        task_name: row.get("task_name"),
        queue: row.get("queue"),
        state,
        retries: u32::try_from(retries).unwrap_or(u32::MAX),
        result,
        error: row.get("error"),
        worker_id: row.get("worker_id"),
        revoke_requested: revoke_requested != 0,
        created_at: to_datetime(row.get("created_at")),
        started_at: row.get::<Option<i64>, _>("started_at").map(to_datetime),
        finished_at: row.get::<Option<i64>, _>("finished_at").map(to_datetime),
        updated_at: to_datetime(row.get("updated_at")),
        expires_at: row.get::<Option<i64>, _>("expires_at").map(to_datetime),
    })
}

/// SQLite-backed result store, usually sharing the broker's database.
pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_records (
                id TEXT PRIMARY KEY,
                task_name TEXT NOT NULL,
                queue TEXT NOT NULL,
                state TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                result TEXT,
                error TEXT,
                worker_id TEXT,
                revoke_requested INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_records_updated ON task_records (updated_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_task_records_expires ON task_records (expires_at)")
            .execute(&self.pool)
            .await?;

        info!("SQLite result store schema initialized");
        Ok(())
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT * FROM task_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    /// Unexpired record; an expired one is deleted on the way out.
    async fn fetch_live(&self, id: Uuid) -> Result<Option<TaskRecord>> {
        let now = Utc::now();
        match self.fetch(id).await? {
            Some(record) if record.is_expired(now) => {
                sqlx::query("DELETE FROM task_records WHERE id = ? AND expires_at <= ?")
                    .bind(id.to_string())
                    .bind(now.timestamp_millis())
                    .execute(&self.pool)
                    .await?;
                debug!(task_id = %id, "Dropped expired result on read");
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn insert_record(&self, record: &TaskRecord, replace: bool) -> Result<u64> {
        let verb = if replace { "INSERT OR REPLACE" } else { "INSERT OR IGNORE" };
        let sql = format!(
            r#"
            {verb} INTO task_records
                (id, task_name, queue, state, retries, result, error, worker_id, revoke_requested,
                 created_at, started_at, finished_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        );
        let result = record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let done = sqlx::query(&sql)
            .bind(record.id.to_string())
            .bind(&record.task_name)
            .bind(&record.queue)
            .bind(record.state.as_str())
            .bind(i64::from(record.retries))
            .bind(result)
            .bind(&record.error)
            .bind(&record.worker_id)
            .bind(i64::from(record.revoke_requested))
            .bind(record.created_at.timestamp_millis())
            .bind(record.started_at.map(|t| t.timestamp_millis()))
            .bind(record.finished_at.map(|t| t.timestamp_millis()))
            .bind(record.updated_at.timestamp_millis())
            .bind(record.expires_at.map(|t| t.timestamp_millis()))
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn set_progress(&self, id: Uuid, state: TaskState, retries: u32, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE task_records
            SET state = ?, retries = ?, error = ?, updated_at = ?,
                worker_id = CASE WHEN ? = 'RETRY' THEN NULL ELSE worker_id END
            WHERE id = ?
            "#,
        )
        .bind(state.as_str())
        .bind(i64::from(retries))
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(state.as_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn record_pending(&self, message: &TaskMessage) -> Result<()> {
        let now = Utc::now();
        // Clear out an expired predecessor so the id can be reused
        sqlx::query("DELETE FROM task_records WHERE id = ? AND expires_at <= ?")
            .bind(message.id.to_string())
            .bind(now.timestamp_millis())
            .execute(&self.pool)
            .await?;
        self.insert_record(&TaskRecord::pending(message, now), false).await?;
        Ok(())
    }

    async fn mark_started(&self, message: &TaskMessage, worker_id: &str) -> Result<StartDecision> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            r#"
            UPDATE task_records
            SET state = 'STARTED', worker_id = ?, retries = ?, started_at = ?, updated_at = ?
            WHERE id = ?
              AND revoke_requested = 0
              AND state NOT IN {TERMINAL_STATES}
              AND (expires_at IS NULL OR expires_at > ?)
            "#
        );

        let updated = sqlx::query(&sql)
            .bind(worker_id)
            .bind(i64::from(message.retries))
            .bind(now)
            .bind(now)
            .bind(message.id.to_string())
            .bind(now)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 1 {
            return Ok(StartDecision::Proceed);
        }

        match self.fetch_live(message.id).await? {
            Some(record) if record.revoke_requested => Ok(StartDecision::Revoked),
            Some(record) if record.state.is_terminal() => Ok(StartDecision::AlreadyFinished(record.state)),
            _ => {
                // No record (never recorded or expired): start one
                let mut record = TaskRecord::pending(message, Utc::now());
                record.state = TaskState::Started;
                record.worker_id = Some(worker_id.to_string());
                record.started_at = Some(record.updated_at);
                self.insert_record(&record, true).await?;
                Ok(StartDecision::Proceed)
            }
        }
    }

    async fn record_failure(&self, id: Uuid, retries: u32, error: &str) -> Result<()> {
        self.set_progress(id, TaskState::Failure, retries, error).await
    }

    async fn record_retry(&self, id: Uuid, retries: u32, error: &str) -> Result<()> {
        self.set_progress(id, TaskState::Retry, retries, error).await
    }

    async fn put(&self, id: Uuid, outcome: &TaskOutcome, ttl: Duration) -> Result<()> {
        ensure_terminal(outcome)?;
        let now = Utc::now();
        let result = outcome.result.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO task_records
                (id, task_name, queue, state, retries, result, error, worker_id,
                 created_at, finished_at, updated_at, expires_at)
            VALUES (?, '', '', ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                retries = excluded.retries,
                result = excluded.result,
                error = excluded.error,
                worker_id = excluded.worker_id,
                finished_at = excluded.finished_at,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(id.to_string())
        .bind(outcome.state.as_str())
        .bind(i64::from(outcome.retries))
        .bind(result)
        .bind(&outcome.error)
        .bind(&outcome.worker_id)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(expiry(now, ttl).timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(task_id = %id, state = %outcome.state, "Outcome stored");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<TaskLookup> {
        Ok(TaskLookup::from_record(self.fetch_live(id).await?))
    }

    async fn request_revoke(&self, id: Uuid) -> Result<RevokeOutcome> {
        let now = Utc::now().timestamp_millis();
        let flagged = sqlx::query(
            r#"
            UPDATE task_records
            SET revoke_requested = 1, updated_at = ?
            WHERE id = ? AND state IN ('PENDING', 'RETRY') AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if flagged.rows_affected() == 1 {
            return Ok(RevokeOutcome::Flagged);
        }

        Ok(match self.fetch_live(id).await? {
            None => RevokeOutcome::NotFound,
            Some(record) if record.state.is_terminal() => RevokeOutcome::AlreadyTerminal(record.state),
            Some(_) => RevokeOutcome::AlreadyStarted,
        })
    }

    async fn is_revoked(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .fetch_live(id)
            .await?
            .is_some_and(|record| record.revoke_requested || record.state == TaskState::Revoked))
    }

    async fn state_histogram(&self, since: DateTime<Utc>) -> Result<StateHistogram> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS count
            FROM task_records
            WHERE updated_at >= ? AND (expires_at IS NULL OR expires_at > ?)
            GROUP BY state
            "#,
        )
        .bind(since.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        let mut histogram = StateHistogram::new();
        for row in rows {
            let state: String = row.get("state");
            let count: i64 = row.get("count");
            if let Ok(state) = state.parse::<TaskState>() {
                histogram.insert(state, count as u64);
            }
        }
        Ok(histogram)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM task_records WHERE expires_at <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            info!(purged = result.rows_affected(), "Expired results purged");
        }
        Ok(result.rows_affected())
    }
}
