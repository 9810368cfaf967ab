//! Executor, producer and pool behaviour against the in-memory backends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bl_broker::{Broker, BrokerError, MemoryBroker, MemoryWorkerRegistry, WorkerRegistry};
use bl_common::{
    DeadLetter, Delivery, QueueDepth, RetryPolicy, TaskMessage, TaskRequest, TaskState,
};
use bl_results::{MemoryResultStore, ResultStore, TaskLookup};
use bl_worker::{
    handler_fn, Executor, ProducerConfig, TaskContext, TaskError, TaskProducer, TaskRegistry,
    WorkerError, WorkerPool, WorkerPoolConfig,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

const TTL: Duration = Duration::from_secs(3600);

/// Wraps the memory broker, records retry delays and redelivers retries immediately.
struct RecordingBroker {
    inner: MemoryBroker,
    retry_delays: Mutex<Vec<Duration>>,
    failing_enqueues: AtomicU32,
}

impl RecordingBroker {
    fn new(visibility: Duration) -> Self {
        Self {
            inner: MemoryBroker::with_poll_interval(visibility, Duration::from_millis(10)),
            retry_delays: Mutex::new(Vec::new()),
            failing_enqueues: AtomicU32::new(0),
        }
    }

    fn fail_next_enqueues(&self, n: u32) {
        self.failing_enqueues.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn enqueue(&self, message: &TaskMessage) -> bl_broker::Result<Uuid> {
        let remaining = self.failing_enqueues.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_enqueues.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::Unavailable("database is locked".to_string()));
        }
        self.inner.enqueue(message).await
    }

    async fn try_dequeue(&self, queue: &str) -> bl_broker::Result<Option<Delivery>> {
        self.inner.try_dequeue(queue).await
    }

    async fn ack(&self, receipt_handle: &str) -> bl_broker::Result<()> {
        self.inner.ack(receipt_handle).await
    }

    async fn nack(&self, receipt_handle: &str, delay: Duration) -> bl_broker::Result<()> {
        self.inner.nack(receipt_handle, delay).await
    }

    async fn retry(&self, receipt_handle: &str, message: &TaskMessage, delay: Duration) -> bl_broker::Result<()> {
        self.retry_delays.lock().push(delay);
        self.inner.retry(receipt_handle, message, Duration::ZERO).await
    }

    async fn extend_visibility(&self, receipt_handle: &str, period: Duration) -> bl_broker::Result<()> {
        self.inner.extend_visibility(receipt_handle, period).await
    }

    async fn dead_letter(&self, receipt_handle: &str, reason: &str) -> bl_broker::Result<()> {
        self.inner.dead_letter(receipt_handle, reason).await
    }

    async fn depth(&self, queue: &str) -> bl_broker::Result<QueueDepth> {
        self.inner.depth(queue).await
    }

    async fn queues(&self) -> bl_broker::Result<Vec<String>> {
        self.inner.queues().await
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> bl_broker::Result<Vec<DeadLetter>> {
        self.inner.dead_letters(queue, limit).await
    }

    async fn purge_dead_letters(&self, queue: &str) -> bl_broker::Result<u64> {
        self.inner.purge_dead_letters(queue).await
    }

    fn visibility_timeout(&self) -> Duration {
        self.inner.visibility_timeout()
    }

    fn poll_interval(&self) -> Duration {
        self.inner.poll_interval()
    }

    fn is_healthy(&self) -> bool {
        true
    }
}

struct Harness {
    broker: Arc<RecordingBroker>,
    results: Arc<MemoryResultStore>,
    producer: TaskProducer,
    executor: Arc<Executor>,
    calls: Arc<AtomicU32>,
}

fn harness(visibility: Duration, task_timeout: Duration, registry: TaskRegistry) -> Harness {
    let broker = Arc::new(RecordingBroker::new(visibility));
    let results = Arc::new(MemoryResultStore::new());
    let producer_config = ProducerConfig {
        backoff: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        ..Default::default()
    };
    let producer = TaskProducer::new(broker.clone(), results.clone(), producer_config);
    let executor = Arc::new(Executor::new(
        broker.clone(),
        results.clone(),
        Arc::new(registry),
        "worker-test",
        task_timeout,
        TTL,
    ));
    Harness {
        broker,
        results,
        producer,
        executor,
        calls: Arc::new(AtomicU32::new(0)),
    }
}

fn counting_registry(calls: &Arc<AtomicU32>, outcome: Result<Value, TaskError>) -> TaskRegistry {
    let calls = calls.clone();
    TaskRegistry::new()
        .with(
            "job",
            handler_fn(move |_ctx: TaskContext| {
                let calls = calls.clone();
                let outcome = outcome.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    outcome
                }
            }),
        )
        .unwrap()
}

fn build(outcome: Result<Value, TaskError>) -> Harness {
    let calls = Arc::new(AtomicU32::new(0));
    let mut h = harness(
        Duration::from_secs(30),
        Duration::from_secs(5),
        counting_registry(&calls, outcome),
    );
    h.calls = calls;
    h
}

async fn next_delivery(broker: &RecordingBroker) -> Delivery {
    broker
        .dequeue("default", Duration::from_secs(2))
        .await
        .unwrap()
        .expect("delivery")
}

#[tokio::test]
async fn test_success_writes_result_then_acks() {
    let h = build(Ok(json!({"sent": true})));
    let id = h.producer.send(TaskRequest::new("job")).await.unwrap();

    let state = h.executor.process(next_delivery(&h.broker).await).await.unwrap();
    assert_eq!(state, TaskState::Success);

    match h.results.get(id).await.unwrap() {
        TaskLookup::Complete(record) => {
            assert_eq!(record.result, Some(json!({"sent": true})));
            assert_eq!(record.worker_id.as_deref(), Some("worker-test"));
        }
        other => panic!("expected complete, got {other:?}"),
    }
    let depth = h.broker.depth("default").await.unwrap();
    assert_eq!(depth.pending + depth.in_flight + depth.delayed, 0);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_with_exponential_delays() {
    let h = build(Err(TaskError::transient("smtp unavailable")));
    let policy = RetryPolicy {
        max_retries: 3,
        base_delay_ms: 100,
        backoff_multiplier: 2.0,
    };
    let id = h
        .producer
        .send(TaskRequest::new("job").with_retry_policy(policy))
        .await
        .unwrap();

    let mut states = Vec::new();
    loop {
        let state = h.executor.process(next_delivery(&h.broker).await).await.unwrap();
        states.push(state);
        if state != TaskState::Retry {
            break;
        }
    }

    assert_eq!(
        states,
        vec![TaskState::Retry, TaskState::Retry, TaskState::Retry, TaskState::DeadLetter]
    );
    assert_eq!(h.calls.load(Ordering::SeqCst), 4);
    assert_eq!(
        *h.broker.retry_delays.lock(),
        vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );

    let record = h.results.get(id).await.unwrap().record().cloned().unwrap();
    assert_eq!(record.state, TaskState::DeadLetter);
    assert_eq!(record.retries, 3);
    assert!(record.error.unwrap().contains("smtp unavailable"));

    let letters = h.broker.dead_letters("default", 10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message.id, id);
    assert_eq!(letters[0].message.retries, 3);
}

#[tokio::test]
async fn test_permanent_error_dead_letters_immediately() {
    let h = build(Err(TaskError::permanent("invalid address")));
    let id = h.producer.send(TaskRequest::new("job")).await.unwrap();

    let state = h.executor.process(next_delivery(&h.broker).await).await.unwrap();
    assert_eq!(state, TaskState::DeadLetter);
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert!(h.broker.retry_delays.lock().is_empty());
    assert_eq!(h.results.get(id).await.unwrap().state(), TaskState::DeadLetter);
}

#[tokio::test]
async fn test_unregistered_task_dead_letters() {
    let h = build(Ok(json!(null)));
    let id = h.producer.send(TaskRequest::new("no_such_task")).await.unwrap();

    let state = h.executor.process(next_delivery(&h.broker).await).await.unwrap();
    assert_eq!(state, TaskState::DeadLetter);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    let record = h.results.get(id).await.unwrap().record().cloned().unwrap();
    assert!(record.error.unwrap().contains("unregistered task"));
}

#[tokio::test]
async fn test_revoked_pending_task_never_runs() {
    let h = build(Ok(json!(null)));
    let id = h.producer.send(TaskRequest::new("job")).await.unwrap();
    h.results.request_revoke(id).await.unwrap();

    let state = h.executor.process(next_delivery(&h.broker).await).await.unwrap();
    assert_eq!(state, TaskState::Revoked);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.results.get(id).await.unwrap().state(), TaskState::Revoked);
    assert_eq!(h.broker.depth("default").await.unwrap().in_flight, 0);
}

#[tokio::test]
async fn test_timeout_cancels_handler_and_follows_retry_logic() {
    let calls = Arc::new(AtomicU32::new(0));
    let finished = Arc::new(AtomicU32::new(0));
    let (c, f) = (calls.clone(), finished.clone());
    let registry = TaskRegistry::new()
        .with(
            "slow",
            handler_fn(move |_ctx: TaskContext| {
                let (c, f) = (c.clone(), f.clone());
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        )
        .unwrap();
    let h = harness(Duration::from_secs(30), Duration::from_millis(50), registry);

    let policy = RetryPolicy {
        max_retries: 1,
        base_delay_ms: 10,
        backoff_multiplier: 2.0,
    };
    let id = h
        .producer
        .send(TaskRequest::new("slow").with_retry_policy(policy))
        .await
        .unwrap();

    assert_eq!(
        h.executor.process(next_delivery(&h.broker).await).await.unwrap(),
        TaskState::Retry
    );
    assert_eq!(
        h.executor.process(next_delivery(&h.broker).await).await.unwrap(),
        TaskState::DeadLetter
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(finished.load(Ordering::SeqCst), 0);

    let record = h.results.get(id).await.unwrap().record().cloned().unwrap();
    assert!(record.error.unwrap().contains("timed out"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_blocking_handler_holds_slot_until_it_ends() {
    let finished = Arc::new(AtomicU32::new(0));
    let f = finished.clone();
    let registry = TaskRegistry::new()
        .with(
            "blocking",
            handler_fn(move |_ctx: TaskContext| {
                let f = f.clone();
                async move {
                    std::thread::sleep(Duration::from_millis(300));
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            }),
        )
        .unwrap();
    let h = harness(Duration::from_secs(30), Duration::from_millis(50), registry);

    let policy = RetryPolicy {
        max_retries: 0,
        base_delay_ms: 10,
        backoff_multiplier: 2.0,
    };
    let id = h
        .producer
        .send(TaskRequest::new("blocking").with_retry_policy(policy))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let state = h.executor.process(next_delivery(&h.broker).await).await.unwrap();
    assert_eq!(state, TaskState::DeadLetter);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() >= Duration::from_millis(300));

    let record = h.results.get(id).await.unwrap().record().cloned().unwrap();
    assert!(record.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_crashed_worker_task_recovered_once_after_visibility_timeout() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(
        Duration::from_millis(200),
        Duration::from_millis(100),
        counting_registry(&calls, Ok(json!("done"))),
    );
    let id = h.producer.send(TaskRequest::new("job")).await.unwrap();

    // First worker claims the message, marks it started, then dies
    let lost = next_delivery(&h.broker).await;
    h.results.mark_started(&lost.message, "crashed-worker").await.unwrap();
    assert!(h.broker.try_dequeue("default").await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(250)).await;
    let recovered = h.broker.try_dequeue("default").await.unwrap().expect("redelivered");
    assert_eq!(recovered.message.id, id);
    assert_eq!(recovered.receive_count, 2);
    assert!(h.broker.try_dequeue("default").await.unwrap().is_none());

    assert_eq!(h.executor.process(recovered).await.unwrap(), TaskState::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The dead worker's late ack cannot remove anything
    assert!(matches!(
        h.broker.ack(&lost.receipt_handle).await,
        Err(BrokerError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_redelivery_after_outcome_written_is_settled_without_rerun() {
    let h = build(Ok(json!(1)));
    let id = h.producer.send(TaskRequest::new("job")).await.unwrap();
    let delivery = next_delivery(&h.broker).await;

    // Outcome landed but the ack never did
    h.results.mark_started(&delivery.message, "w").await.unwrap();
    h.results
        .put(id, &bl_common::TaskOutcome::success(json!(1), 0), TTL)
        .await
        .unwrap();
    h.broker.nack(&delivery.receipt_handle, Duration::ZERO).await.unwrap();

    let state = h.executor.process(next_delivery(&h.broker).await).await.unwrap();
    assert_eq!(state, TaskState::Success);
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.broker.depth("default").await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_long_handler_keeps_claim_alive() {
    let registry = TaskRegistry::new()
        .with(
            "long",
            handler_fn(|_ctx: TaskContext| async {
                tokio::time::sleep(Duration::from_millis(400)).await;
                Ok(json!(null))
            }),
        )
        .unwrap();
    let h = harness(Duration::from_millis(100), Duration::from_secs(5), registry);
    h.producer.send(TaskRequest::new("long")).await.unwrap();

    let delivery = next_delivery(&h.broker).await;
    let executor = h.executor.clone();
    let running = tokio::spawn(async move { executor.process(delivery).await });

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.broker.try_dequeue("default").await.unwrap().is_none());
    }
    assert_eq!(running.await.unwrap().unwrap(), TaskState::Success);
}

#[tokio::test]
async fn test_producer_backs_off_while_broker_unavailable() {
    let h = build(Ok(json!(null)));
    h.broker.fail_next_enqueues(2);
    let id = h.producer.send(TaskRequest::new("job")).await.unwrap();
    assert_eq!(h.broker.depth("default").await.unwrap().pending, 1);
    assert_eq!(h.results.get(id).await.unwrap().state(), TaskState::Pending);

    h.broker.fail_next_enqueues(100);
    let result = h.producer.send(TaskRequest::new("job")).await;
    assert!(matches!(result, Err(WorkerError::BrokerUnavailable { attempts: 5, .. })));
}

#[tokio::test]
async fn test_unqueued_task_record_is_closed() {
    let h = build(Ok(json!(null)));
    h.broker.fail_next_enqueues(100);
    let id = Uuid::new_v4();
    let mut request = TaskRequest::new("job");
    request.id = Some(id);

    let result = h.producer.send(request).await;
    assert!(matches!(result, Err(WorkerError::BrokerUnavailable { .. })));

    let lookup = h.results.get(id).await.unwrap();
    assert_eq!(lookup.state(), TaskState::DeadLetter);
    let record = lookup.record().cloned().unwrap();
    assert!(record.error.unwrap().contains("enqueue failed"));
    assert_eq!(h.broker.depth("default").await.unwrap().pending, 0);
}

#[tokio::test]
async fn test_failed_resend_leaves_finished_record_alone() {
    let h = build(Ok(json!("done")));
    let id = Uuid::new_v4();
    let mut request = TaskRequest::new("job");
    request.id = Some(id);
    h.producer.send(request.clone()).await.unwrap();
    assert_eq!(
        h.executor.process(next_delivery(&h.broker).await).await.unwrap(),
        TaskState::Success
    );

    h.broker.fail_next_enqueues(100);
    assert!(h.producer.send(request).await.is_err());
    assert_eq!(h.results.get(id).await.unwrap().state(), TaskState::Success);
}

#[tokio::test]
async fn test_producer_validation() {
    let h = build(Ok(json!(null)));
    let producer = h.producer.clone().with_known_tasks(vec!["job".to_string()]);

    assert!(matches!(
        producer.send(TaskRequest::new("other")).await,
        Err(WorkerError::UnknownTask(_))
    ));
    assert!(matches!(
        producer.send(TaskRequest::new("")).await,
        Err(WorkerError::Validation(_))
    ));

    producer
        .send(TaskRequest::new("job").with_countdown(60.0))
        .await
        .unwrap();
    let depth = h.broker.depth("default").await.unwrap();
    assert_eq!(depth.delayed, 1);
    assert_eq!(depth.pending, 0);
}

#[tokio::test]
async fn test_same_id_enqueued_once() {
    let h = build(Ok(json!(null)));
    let id = Uuid::new_v4();
    let mut request = TaskRequest::new("job");
    request.id = Some(id);

    assert_eq!(h.producer.send(request.clone()).await.unwrap(), id);
    assert_eq!(h.producer.send(request).await.unwrap(), id);
    assert_eq!(h.broker.depth("default").await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_pool_runs_tasks_and_deregisters_on_shutdown() {
    let calls = Arc::new(AtomicU32::new(0));
    let h = harness(
        Duration::from_secs(30),
        Duration::from_secs(5),
        counting_registry(&calls, Ok(json!("ok"))),
    );
    let workers = Arc::new(MemoryWorkerRegistry::new());

    let mut ids = Vec::new();
    for i in 0..10 {
        let queue = if i % 2 == 0 { "high" } else { "low" };
        ids.push(h.producer.send(TaskRequest::new("job").with_queue(queue)).await.unwrap());
    }

    let config = WorkerPoolConfig {
        worker_id: "pool-test".to_string(),
        queues: vec!["high".to_string(), "low".to_string()],
        concurrency: 3,
        heartbeat_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(2),
        ..Default::default()
    };
    let pool = Arc::new(WorkerPool::new(config, h.broker.clone(), workers.clone(), h.executor.clone()).unwrap());
    let running = tokio::spawn(pool.clone().run());

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut done = 0;
            for id in &ids {
                if matches!(h.results.get(*id).await.unwrap(), TaskLookup::Complete(_)) {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let listed = workers.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "pool-test");
    assert_eq!(listed[0].task_names, vec!["job"]);

    pool.shutdown();
    running.await.unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert!(workers.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pool_rejects_empty_queue_list() {
    let h = build(Ok(json!(null)));
    let config = WorkerPoolConfig {
        queues: Vec::new(),
        ..Default::default()
    };
    let result = WorkerPool::new(config, h.broker.clone(), Arc::new(MemoryWorkerRegistry::new()), h.executor.clone());
    assert!(matches!(result, Err(WorkerError::Config(_))));
}
