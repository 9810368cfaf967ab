//! Worker pool: semaphore-bounded executors fed by a single fetch loop.
//!
//! - Priority-ordered queue polling with starvation protection
//! - Capped exponential backoff while the broker is unavailable
//! - Heartbeats into the worker registry, reaping stale peers
//! - Graceful shutdown: stop fetching, drain in-flight tasks, deregister

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bl_broker::{Broker, WorkerRegistry};
use bl_common::{Delivery, WorkerRecord};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::executor::Executor;
use crate::selector::QueueSelector;
use crate::{capped_backoff, Result, WorkerError};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_id: String,
    pub hostname: String,
    /// Highest priority first
    pub queues: Vec<String>,
    pub concurrency: u32,
    pub starvation_limit: u32,
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
    pub shutdown_grace: Duration,
    pub fetch_backoff_max: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", std::process::id()),
            hostname: "localhost".to_string(),
            queues: vec![bl_common::DEFAULT_QUEUE.to_string()],
            concurrency: 4,
            starvation_limit: 8,
            heartbeat_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            fetch_backoff_max: Duration::from_secs(30),
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Arc<dyn Broker>,
    workers: Arc<dyn WorkerRegistry>,
    executor: Arc<Executor>,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicU32>,
    started_at: DateTime<Utc>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<dyn Broker>,
        workers: Arc<dyn WorkerRegistry>,
        executor: Arc<Executor>,
    ) -> Result<Self> {
        if config.queues.is_empty() {
            return Err(WorkerError::Config("worker needs at least one queue".to_string()));
        }
        if config.concurrency == 0 {
            return Err(WorkerError::Config("concurrency must be at least 1".to_string()));
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.concurrency as usize)),
            config,
            broker,
            workers,
            executor,
            active: Arc::new(AtomicU32::new(0)),
            started_at: Utc::now(),
            shutdown_tx,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn active_tasks(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop fetching. `run` returns once in-flight tasks drain or the grace period ends.
    pub fn shutdown(&self) {
        info!(worker_id = %self.config.worker_id, "Worker shutdown requested");
        self.shutdown_tx.send_replace(true);
    }

    fn record(&self) -> WorkerRecord {
        WorkerRecord {
            id: self.config.worker_id.clone(),
            hostname: self.config.hostname.clone(),
            pid: std::process::id(),
            concurrency: self.config.concurrency,
            queues: self.config.queues.clone(),
            task_names: self.executor.registry().names(),
            active_tasks: self.active_tasks(),
            started_at: self.started_at,
            last_heartbeat: Utc::now(),
        }
    }

    /// Run until [`WorkerPool::shutdown`] is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            tasks = ?self.executor.registry().names(),
            "Worker pool starting"
        );

        if let Err(e) = self.workers.heartbeat(&self.record()).await {
            warn!(error = %e, "Initial heartbeat failed");
        }
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());

        self.fetch_loop().await;
        self.drain().await;

        heartbeat.abort();
        if let Err(e) = self.workers.deregister(&self.config.worker_id).await {
            warn!(error = %e, "Failed to deregister worker");
        }
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    async fn fetch_loop(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut selector = QueueSelector::new(self.config.queues.clone(), self.config.starvation_limit);
        let mut consecutive_errors: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("Semaphore closed");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => break,
            };

            // Not raced against shutdown: a cancelled fetch could strand a claimed message
            match self.fetch(&mut selector).await {
                Ok(Some(delivery)) => {
                    consecutive_errors = 0;
                    selector.record(&delivery.queue);
                    self.spawn_executor(delivery, permit);
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    let delay = capped_backoff(
                        self.broker.poll_interval(),
                        self.config.fetch_backoff_max,
                        consecutive_errors,
                    );
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Fetch failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
        }
        debug!(worker_id = %self.config.worker_id, "Fetch loop stopped");
    }

    /// One non-blocking pass in selector order, then a bounded wait on the top pick.
    async fn fetch(&self, selector: &mut QueueSelector) -> bl_broker::Result<Option<Delivery>> {
        let order = selector.order();
        for queue in &order {
            if let Some(delivery) = self.broker.try_dequeue(queue).await? {
                return Ok(Some(delivery));
            }
        }
        match order.first() {
            Some(queue) => self.broker.dequeue(queue, self.broker.poll_interval()).await,
            None => Ok(None),
        }
    }

    fn spawn_executor(&self, delivery: Delivery, permit: tokio::sync::OwnedSemaphorePermit) {
        let executor = self.executor.clone();
        let active = self.active.clone();
        active.fetch_add(1, Ordering::SeqCst);
        metrics::gauge!("backlot.worker.active_tasks").increment(1.0);

        tokio::spawn(async move {
            let _permit = permit;
            let task_id = delivery.message.id;
            match executor.process(delivery).await {
                Ok(state) => debug!(task_id = %task_id, state = %state, "Delivery processed"),
                Err(e) => error!(task_id = %task_id, error = %e, "Delivery processing failed"),
            }
            active.fetch_sub(1, Ordering::SeqCst);
            metrics::gauge!("backlot.worker.active_tasks").decrement(1.0);
        });
    }

    async fn drain(&self) {
        let in_flight = self.active_tasks();
        if in_flight > 0 {
            info!(in_flight, grace_secs = self.config.shutdown_grace.as_secs(), "Waiting for in-flight tasks");
        }

        let all = self.config.concurrency;
        match tokio::time::timeout(self.config.shutdown_grace, self.semaphore.acquire_many(all)).await {
            Ok(Ok(_permits)) => info!("All in-flight tasks finished"),
            Ok(Err(_)) => error!("Semaphore closed while draining"),
            Err(_) => warn!(
                still_running = self.active_tasks(),
                "Grace period elapsed; unfinished tasks will be redelivered after their visibility timeout"
            ),
        }
    }

    /// Runs until aborted by `run`, so heartbeats continue while draining.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = self.workers.heartbeat(&self.record()).await {
                warn!(error = %e, "Heartbeat failed");
            }
            match self.workers.reap_stale(self.config.stale_after).await {
                Ok(reaped) if !reaped.is_empty() => {
                    info!(reaped = ?reaped, "Reaped stale workers");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to reap stale workers"),
            }
        }
    }
}
