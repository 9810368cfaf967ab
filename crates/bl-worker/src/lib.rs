//! Backlot Worker
//!
//! Everything that produces or executes tasks:
//! - [`TaskRegistry`]: handlers by task name, built once at startup
//! - [`TaskProducer`]: validates requests and enqueues them
//! - [`Executor`]: runs one delivery through the task state machine
//! - [`WorkerPool`]: bounded executors pulling from prioritized queues
//! - [`Backends`]: storage selected from configuration

use std::time::Duration;

use bl_broker::BrokerError;
use bl_common::ValidationError;
use bl_results::ResultStoreError;
use thiserror::Error;

pub mod backends;
pub mod executor;
pub mod integration;
pub mod maintenance;
pub mod pool;
pub mod producer;
pub mod selector;
pub mod task;

pub use backends::Backends;
pub use executor::Executor;
pub use integration::{HttpIntegrationClient, IntegrationClient, IntegrationPayload, IntegrationTask};
pub use maintenance::PurgeExpiredResultsTask;
pub use pool::{WorkerPool, WorkerPoolConfig};
pub use producer::{ProducerConfig, TaskProducer};
pub use selector::QueueSelector;
pub use task::{handler_fn, FnHandler, TaskContext, TaskError, TaskHandler, TaskRegistry};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Invalid task request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Result store error: {0}")]
    Results(#[from] ResultStoreError),

    #[error("Broker unavailable after {attempts} attempts: {reason}")]
    BrokerUnavailable { attempts: u32, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkerError {
    /// Storage outage worth backing off and retrying.
    pub fn is_unavailable(&self) -> bool {
        match self {
            WorkerError::Broker(e) => e.is_unavailable(),
            WorkerError::Results(ResultStoreError::Unavailable(_)) => true,
            WorkerError::BrokerUnavailable { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// `base * 2^attempt`, capped at `max`.
pub(crate) fn capped_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(20));
    base.saturating_mul(factor).min(max)
}
