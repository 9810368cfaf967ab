//! Runs a single delivery through the task state machine.
//!
//! PENDING -> STARTED -> SUCCESS, or FAILURE -> RETRY (nack with backoff) until
//! the retry budget is spent, then DEAD_LETTER. Outcomes are written to the
//! result store before the broker is settled, so a crash in between leads to
//! re-execution rather than a lost result.

use std::sync::Arc;
use std::time::Duration;

use bl_broker::Broker;
use bl_common::{Delivery, TaskOutcome, TaskState};
use bl_results::{ResultStore, StartDecision};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::task::{TaskContext, TaskError, TaskHandler, TaskRegistry};
use crate::Result;

const MIN_EXTEND_PERIOD: Duration = Duration::from_millis(10);

pub struct Executor {
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultStore>,
    registry: Arc<TaskRegistry>,
    worker_id: String,
    task_timeout: Duration,
    result_ttl: Duration,
}

impl Executor {
    pub fn new(
        broker: Arc<dyn Broker>,
        results: Arc<dyn ResultStore>,
        registry: Arc<TaskRegistry>,
        worker_id: impl Into<String>,
        task_timeout: Duration,
        result_ttl: Duration,
    ) -> Self {
        Self {
            broker,
            results,
            registry,
            worker_id: worker_id.into(),
            task_timeout,
            result_ttl,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Process one delivery and settle it with the broker.
    ///
    /// Returns the state the task was left in.
    pub async fn process(&self, delivery: Delivery) -> Result<TaskState> {
        let message = &delivery.message;
        debug!(
            task_id = %message.id,
            task_name = %message.task_name,
            queue = %delivery.queue,
            receive_count = delivery.receive_count,
            "Processing delivery"
        );

        let Some(handler) = self.registry.get(&message.task_name) else {
            warn!(task_id = %message.id, task_name = %message.task_name, "No handler registered");
            let reason = format!("unregistered task: {}", message.task_name);
            return self.dead_letter(&delivery, &reason).await;
        };

        match self.results.mark_started(message, &self.worker_id).await? {
            StartDecision::Proceed => {}
            StartDecision::Revoked => {
                let outcome = TaskOutcome::revoked(message.retries).by_worker(&self.worker_id);
                self.results.put(message.id, &outcome, self.result_ttl).await?;
                self.ack(&delivery).await;
                metrics::counter!("backlot.tasks.revoked_total").increment(1);
                info!(task_id = %message.id, "Task revoked before execution");
                return Ok(TaskState::Revoked);
            }
            StartDecision::AlreadyFinished(state) => {
                // Redelivery after the outcome was written but before the ack landed
                info!(task_id = %message.id, state = %state, "Task already finished, settling redelivery");
                if state == TaskState::DeadLetter {
                    self.settle_dead_letter(&delivery, "already dead-lettered").await;
                } else {
                    self.ack(&delivery).await;
                }
                return Ok(state);
            }
        }

        metrics::counter!("backlot.tasks.started_total", "task" => message.task_name.clone()).increment(1);
        let started = Instant::now();
        let result = self.run_handler(handler, &delivery).await;
        metrics::histogram!("backlot.tasks.duration_seconds", "task" => message.task_name.clone())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(value) => self.succeed(&delivery, value).await,
            Err(error) => self.fail(&delivery, error).await,
        }
    }

    /// Run the handler under the task timeout, keeping the claim alive meanwhile.
    ///
    /// On timeout the handler is aborted, but this only returns once its task
    /// has actually ended. A handler that blocks its thread keeps running until
    /// its next await point, and the worker slot stays taken until then.
    async fn run_handler(
        &self,
        handler: Arc<dyn TaskHandler>,
        delivery: &Delivery,
    ) -> std::result::Result<Value, TaskError> {
        let ctx = TaskContext::new(delivery.message.clone(), self.worker_id.clone());
        let mut run = tokio::spawn(async move { handler.run(ctx).await });

        let visibility = self.broker.visibility_timeout();
        let extend_every = (visibility / 2).max(MIN_EXTEND_PERIOD);
        let mut extender = tokio::time::interval_at(Instant::now() + extend_every, extend_every);
        let deadline = tokio::time::sleep(self.task_timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                joined = &mut run => {
                    if timed_out {
                        debug!(task_id = %delivery.message.id, "Timed-out handler has ended");
                        return Err(TaskError::Timeout(self.task_timeout));
                    }
                    return match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => Err(TaskError::Transient("handler panicked".to_string())),
                        Err(e) => Err(TaskError::Transient(format!("handler aborted: {e}"))),
                    };
                }
                _ = &mut deadline, if !timed_out => {
                    run.abort();
                    timed_out = true;
                    warn!(task_id = %delivery.message.id, timeout_ms = self.task_timeout.as_millis() as u64, "Task timed out");
                }
                _ = extender.tick() => {
                    if let Err(e) = self.broker.extend_visibility(&delivery.receipt_handle, visibility).await {
                        warn!(task_id = %delivery.message.id, error = %e, "Failed to extend visibility");
                    }
                }
            }
        }
    }

    async fn succeed(&self, delivery: &Delivery, value: Value) -> Result<TaskState> {
        let message = &delivery.message;
        let outcome = TaskOutcome::success(value, message.retries).by_worker(&self.worker_id);
        self.results.put(message.id, &outcome, self.result_ttl).await?;
        self.ack(delivery).await;

        metrics::counter!("backlot.tasks.succeeded_total", "task" => message.task_name.clone()).increment(1);
        info!(task_id = %message.id, task_name = %message.task_name, retries = message.retries, "Task succeeded");
        Ok(TaskState::Success)
    }

    async fn fail(&self, delivery: &Delivery, error: TaskError) -> Result<TaskState> {
        let message = &delivery.message;
        let reason = error.to_string();
        self.results.record_failure(message.id, message.retries, &reason).await?;
        metrics::counter!("backlot.tasks.failed_total", "task" => message.task_name.clone()).increment(1);

        if !error.is_retryable() {
            warn!(task_id = %message.id, error = %reason, "Permanent failure");
            return self.dead_letter(delivery, &reason).await;
        }

        let policy = &message.retry_policy;
        if policy.is_exhausted(message.retries) {
            warn!(
                task_id = %message.id,
                retries = message.retries,
                max_retries = policy.max_retries,
                error = %reason,
                "Retries exhausted"
            );
            return self.dead_letter(delivery, &reason).await;
        }

        let delay = policy.delay_for(message.retries);
        let next = message.next_attempt();
        self.results.record_retry(message.id, next.retries, &reason).await?;
        if let Err(e) = self.broker.retry(&delivery.receipt_handle, &next, delay).await {
            // The claim lapses on its own and the message comes back with the old retry count
            warn!(task_id = %message.id, error = %e, "Failed to schedule retry");
        }

        metrics::counter!("backlot.tasks.retried_total", "task" => message.task_name.clone()).increment(1);
        info!(
            task_id = %message.id,
            retry = next.retries,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "Task scheduled for retry"
        );
        Ok(TaskState::Retry)
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<TaskState> {
        let message = &delivery.message;
        let outcome = TaskOutcome::dead_letter(reason, message.retries).by_worker(&self.worker_id);
        self.results.put(message.id, &outcome, self.result_ttl).await?;
        self.settle_dead_letter(delivery, reason).await;
        metrics::counter!("backlot.tasks.dead_lettered_total", "task" => message.task_name.clone()).increment(1);
        Ok(TaskState::DeadLetter)
    }

    async fn settle_dead_letter(&self, delivery: &Delivery, reason: &str) {
        if let Err(e) = self.broker.dead_letter(&delivery.receipt_handle, reason).await {
            error!(task_id = %delivery.message.id, error = %e, "Failed to dead-letter message");
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(&delivery.receipt_handle).await {
            warn!(task_id = %delivery.message.id, error = %e, "ACK failed, message may be redelivered");
        }
    }
}
