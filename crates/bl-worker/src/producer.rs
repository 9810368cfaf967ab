//! Producer side: validate, record PENDING, enqueue.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bl_broker::Broker;
use bl_common::{RetryPolicy, TaskMessage, TaskOutcome, TaskRequest, TaskState, DEFAULT_QUEUE};
use bl_results::ResultStore;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{capped_backoff, Result, WorkerError};

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub default_queue: String,
    pub default_retry: RetryPolicy,
    /// Attempts per storage call while the broker is unavailable
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
    /// Lifetime of the terminal record written when enqueueing gives up
    pub result_ttl: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_string(),
            default_retry: RetryPolicy::default(),
            max_attempts: 5,
            backoff: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
            result_ttl: Duration::from_secs(86_400),
        }
    }
}

/// Enqueues tasks. Returns as soon as the message is stored.
#[derive(Clone)]
pub struct TaskProducer {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    config: ProducerConfig,
    known_tasks: Option<Arc<HashSet<String>>>,
}

impl TaskProducer {
    pub fn new(broker: Arc<dyn Broker>, results: Arc<dyn ResultStore>, config: ProducerConfig) -> Self {
        Self {
            broker,
            results,
            config,
            known_tasks: None,
        }
    }

    /// Reject task names outside `names` before they reach the queue.
    pub fn with_known_tasks(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.known_tasks = Some(Arc::new(names.into_iter().collect()));
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    /// Validate a request and enqueue it.
    pub async fn send(&self, request: TaskRequest) -> Result<Uuid> {
        let message = request.into_message(
            &self.config.default_queue,
            &self.config.default_retry,
            Utc::now(),
        )?;
        self.send_message(message).await
    }

    /// Enqueue a fully formed message. Sending the same id twice stores it once.
    pub async fn send_message(&self, message: TaskMessage) -> Result<Uuid> {
        if let Some(known) = &self.known_tasks {
            if !known.contains(&message.task_name) {
                return Err(WorkerError::UnknownTask(message.task_name));
            }
        }

        let (broker, results, pending) = (&self.broker, &self.results, &message);

        // Record first so a worker never picks up a task without a record
        self.with_backoff("record_pending", || async move {
            results.record_pending(pending).await.map_err(WorkerError::from)
        })
        .await?;

        let enqueued = self
            .with_backoff("enqueue", || async move {
                broker.enqueue(pending).await.map_err(WorkerError::from)
            })
            .await;
        let id = match enqueued {
            Ok(id) => id,
            Err(e) => {
                self.abandon(&message, &e).await;
                return Err(e);
            }
        };

        metrics::counter!("backlot.tasks.enqueued_total", "queue" => message.queue.clone()).increment(1);
        info!(
            task_id = %id,
            task_name = %message.task_name,
            queue = %message.queue,
            eta = ?message.eta,
            "Task enqueued"
        );
        Ok(id)
    }

    /// Close out the PENDING record of a message that never reached the queue,
    /// so it expires instead of sitting in PENDING forever. Records a worker
    /// has already moved on from are left alone.
    async fn abandon(&self, message: &TaskMessage, cause: &WorkerError) {
        match self.results.get(message.id).await {
            Ok(lookup) if lookup.state() == TaskState::Pending => {}
            Ok(_) => return,
            Err(e) => {
                warn!(task_id = %message.id, error = %e, "Could not read record of unqueued task");
                return;
            }
        }
        let outcome = TaskOutcome::dead_letter(format!("enqueue failed: {cause}"), message.retries);
        match self.results.put(message.id, &outcome, self.config.result_ttl).await {
            Ok(()) => warn!(task_id = %message.id, error = %cause, "Task never enqueued, record closed"),
            Err(e) => warn!(task_id = %message.id, error = %e, "Could not close record of unqueued task"),
        }
    }

    async fn with_backoff<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_unavailable() => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        warn!(operation, attempts = attempt, error = %e, "Giving up, broker unavailable");
                        return Err(WorkerError::BrokerUnavailable {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    let delay = capped_backoff(self.config.backoff, self.config.backoff_max, attempt - 1);
                    debug!(operation, attempt, delay_ms = delay.as_millis() as u64, "Broker unavailable, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
