//! Persistence for schedule definitions and last-fired-at.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::trigger::ScheduleEntry;
use crate::Result;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert or update a definition. An existing last-fired-at is kept.
    async fn upsert(&self, entry: &ScheduleEntry) -> Result<()>;

    /// All entries ordered by name.
    async fn list(&self) -> Result<Vec<ScheduleEntry>>;

    async fn get(&self, name: &str) -> Result<Option<ScheduleEntry>>;

    /// Record (or with `None`, clear) the last fired window.
    async fn set_last_fired(&self, name: &str, at: Option<DateTime<Utc>>) -> Result<()>;

    /// Returns false when no such entry exists.
    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool>;

    /// Returns false when no such entry exists.
    async fn remove(&self, name: &str) -> Result<bool>;
}

#[derive(Default)]
pub struct MemoryScheduleStore {
    entries: Mutex<BTreeMap<String, ScheduleEntry>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn upsert(&self, entry: &ScheduleEntry) -> Result<()> {
        let mut entries = self.entries.lock();
        let last_fired_at = entries.get(&entry.name).and_then(|e| e.last_fired_at);
        let mut stored = entry.clone();
        stored.last_fired_at = last_fired_at;
        entries.insert(entry.name.clone(), stored);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ScheduleEntry>> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<ScheduleEntry>> {
        Ok(self.entries.lock().get(name).cloned())
    }

    async fn set_last_fired(&self, name: &str, at: Option<DateTime<Utc>>) -> Result<()> {
        if let Some(entry) = self.entries.lock().get_mut(name) {
            entry.last_fired_at = at;
        }
        Ok(())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .get_mut(name)
            .map(|entry| entry.enabled = enabled)
            .is_some())
    }

    async fn remove(&self, name: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(name).is_some())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteScheduleStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use sqlx::sqlite::SqliteRow;
    use sqlx::{Row, SqlitePool};
    use std::time::Duration;
    use tracing::info;

    use super::ScheduleStore;
    use crate::trigger::{ScheduleEntry, Trigger};
    use crate::{Result, SchedulerError};

    pub struct SqliteScheduleStore {
        pool: SqlitePool,
    }

    impl SqliteScheduleStore {
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }

        pub async fn init_schema(&self) -> Result<()> {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS schedule_entries (
                    name TEXT PRIMARY KEY,
                    task_name TEXT NOT NULL,
                    trigger_kind TEXT NOT NULL,
                    trigger_spec TEXT NOT NULL,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    jitter_ms INTEGER NOT NULL DEFAULT 0,
                    args TEXT NOT NULL,
                    kwargs TEXT NOT NULL,
                    queue TEXT,
                    retry_policy TEXT,
                    last_fired_at INTEGER,
                    updated_at INTEGER NOT NULL
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            info!("SQLite schedule store schema initialized");
            Ok(())
        }

        fn decode(row: &SqliteRow) -> Result<ScheduleEntry> {
            let name: String = row.get("name");
            let kind: String = row.get("trigger_kind");
            let spec: String = row.get("trigger_spec");
            let trigger = Trigger::from_parts(&kind, &spec).map_err(|e| match e {
                SchedulerError::InvalidTrigger { reason, .. } => SchedulerError::InvalidTrigger {
                    entry: name.clone(),
                    reason,
                },
                other => other,
            })?;

            let args: String = row.get("args");
            let kwargs: String = row.get("kwargs");
            let retry_policy: Option<String> = row.get("retry_policy");
            let enabled: i64 = row.get("enabled");
            let jitter_ms: i64 = row.get("jitter_ms");
            let last_fired_at: Option<i64> = row.get("last_fired_at");

            Ok(ScheduleEntry {
                task_name: row.get("task_name"),
                trigger,
                enabled: enabled != 0,
                last_fired_at: last_fired_at.and_then(DateTime::<Utc>::from_timestamp_millis),
                jitter: Duration::from_millis(u64::try_from(jitter_ms).unwrap_or(0)),
                args: serde_json::from_str(&args)?,
                kwargs: serde_json::from_str(&kwargs)?,
                queue: row.get("queue"),
                retry_policy: retry_policy.map(|raw| serde_json::from_str(&raw)).transpose()?,
                name,
            })
        }
    }

    #[async_trait]
    impl ScheduleStore for SqliteScheduleStore {
        async fn upsert(&self, entry: &ScheduleEntry) -> Result<()> {
            let (kind, spec) = entry.trigger.to_parts();
            let retry_policy = entry
                .retry_policy
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;

            sqlx::query(
                r#"
                INSERT INTO schedule_entries
                    (name, task_name, trigger_kind, trigger_spec, enabled, jitter_ms,
                     args, kwargs, queue, retry_policy, last_fired_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
                ON CONFLICT(name) DO UPDATE SET
                    task_name = excluded.task_name,
                    trigger_kind = excluded.trigger_kind,
                    trigger_spec = excluded.trigger_spec,
                    enabled = excluded.enabled,
                    jitter_ms = excluded.jitter_ms,
                    args = excluded.args,
                    kwargs = excluded.kwargs,
                    queue = excluded.queue,
                    retry_policy = excluded.retry_policy,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entry.name)
            .bind(&entry.task_name)
            .bind(kind)
            .bind(spec)
            .bind(i64::from(entry.enabled))
            .bind(i64::try_from(entry.jitter.as_millis()).unwrap_or(i64::MAX))
            .bind(serde_json::to_string(&entry.args)?)
            .bind(serde_json::to_string(&entry.kwargs)?)
            .bind(&entry.queue)
            .bind(retry_policy)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn list(&self) -> Result<Vec<ScheduleEntry>> {
            let rows = sqlx::query("SELECT * FROM schedule_entries ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(Self::decode).collect()
        }

        async fn get(&self, name: &str) -> Result<Option<ScheduleEntry>> {
            let row = sqlx::query("SELECT * FROM schedule_entries WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(Self::decode).transpose()
        }

        async fn set_last_fired(&self, name: &str, at: Option<DateTime<Utc>>) -> Result<()> {
            sqlx::query("UPDATE schedule_entries SET last_fired_at = ?, updated_at = ? WHERE name = ?")
                .bind(at.map(|t| t.timestamp_millis()))
                .bind(Utc::now().timestamp_millis())
                .bind(name)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
            let result = sqlx::query("UPDATE schedule_entries SET enabled = ?, updated_at = ? WHERE name = ?")
                .bind(i64::from(enabled))
                .bind(Utc::now().timestamp_millis())
                .bind(name)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn remove(&self, name: &str) -> Result<bool> {
            let result = sqlx::query("DELETE FROM schedule_entries WHERE name = ?")
                .bind(name)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }
    }
}
