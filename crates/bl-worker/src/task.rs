//! Task handlers and the name-keyed registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bl_common::TaskMessage;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{Result, WorkerError};

/// How a handler attempt failed. Decides between retry and dead-letter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// Worth retrying with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Retrying cannot help; dead-letter immediately.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The attempt exceeded the per-task timeout and was cancelled.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    pub fn transient(reason: impl Into<String>) -> Self {
        TaskError::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        TaskError::Permanent(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::Permanent(_))
    }
}

/// What a handler sees of the delivery it is running.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub message: TaskMessage,
    pub worker_id: String,
    /// 1 on the first attempt
    pub attempt: u32,
}

impl TaskContext {
    pub fn new(message: TaskMessage, worker_id: impl Into<String>) -> Self {
        let attempt = message.retries.saturating_add(1);
        Self {
            message,
            worker_id: worker_id.into(),
            attempt,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.message.id
    }

    pub fn args(&self) -> &[Value] {
        &self.message.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.message.kwargs
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.message.kwargs.get(key)
    }
}

/// Executes one task attempt. Handlers must tolerate being run more than once
/// for the same task id.
///
/// A timed-out attempt is cancelled at its next await point, so blocking work
/// belongs in `tokio::task::spawn_blocking` or it holds the worker slot past
/// the timeout.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> std::result::Result<Value, TaskError>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, TaskError>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> std::result::Result<Value, TaskError> {
        (self.f)(ctx).await
    }
}

/// Task name to handler, fixed once the worker starts.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A name can only be registered once.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Result<()> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(WorkerError::DuplicateTask(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn with(mut self, name: impl Into<String>, handler: impl TaskHandler + 'static) -> Result<Self> {
        self.register(name, Arc::new(handler))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
