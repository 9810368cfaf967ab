//! Backlot Periodic Scheduler
//!
//! Fires schedule entries into the task queue:
//! - Interval and crontab triggers with drift-free window alignment
//! - Persisted last-fired-at so restarts never double-fire a window
//! - Leader-gated ticks so only one instance fires at a time

use std::time::Duration;

use thiserror::Error;

pub mod clock;
pub mod dispatcher;
pub mod scheduler;
pub mod store;
pub mod trigger;

pub use clock::{ManualClock, SystemClock, WallClock};
pub use dispatcher::TaskDispatcher;
pub use scheduler::{PeriodicScheduler, TickReport};
pub use store::{MemoryScheduleStore, ScheduleStore};
pub use trigger::{DueCheck, ScheduleEntry, Trigger};

#[cfg(feature = "sqlite")]
pub use store::SqliteScheduleStore;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid trigger for '{entry}': {reason}")]
    InvalidTrigger { entry: String, reason: String },

    #[error("Schedule '{entry}' references unknown task '{task}'")]
    UnknownTask { entry: String, task: String },

    #[error("Schedule '{0}' not found")]
    NotFound(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        SchedulerError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl From<&bl_config::SchedulerConfig> for SchedulerConfig {
    fn from(config: &bl_config::SchedulerConfig) -> Self {
        Self {
            enabled: config.enabled,
            tick_interval: Duration::from_millis(config.tick_interval_ms),
        }
    }
}
