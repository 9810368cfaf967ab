//! Due checks, persistence across restarts and leader gating.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bl_broker::{Broker, MemoryBroker};
use bl_common::TaskRequest;
use bl_results::MemoryResultStore;
use bl_scheduler::{
    ManualClock, MemoryScheduleStore, PeriodicScheduler, ScheduleEntry, ScheduleStore,
    SchedulerConfig, SchedulerError, SqliteScheduleStore, TaskDispatcher, Trigger,
};
use bl_standby::{LeaderElection, LeaderElectionConfig, MemoryLease, StandbyGuard};
use bl_worker::{ProducerConfig, TaskProducer};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

fn secs(n: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(n)
}

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<TaskRequest>>,
    failing: AtomicBool,
}

#[async_trait]
impl TaskDispatcher for RecordingDispatcher {
    async fn dispatch(&self, request: TaskRequest) -> bl_scheduler::Result<Uuid> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::Dispatch("broker unavailable".to_string()));
        }
        let id = request.id.unwrap_or_else(Uuid::new_v4);
        self.sent.lock().push(request);
        Ok(id)
    }
}

impl RecordingDispatcher {
    fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

fn every(name: &str, period_secs: u64) -> ScheduleEntry {
    ScheduleEntry::new(
        name,
        "delete_expired_activation_tokens",
        Trigger::interval(Duration::from_secs(period_secs)).unwrap(),
    )
}

fn catalog() -> HashSet<String> {
    ["delete_expired_activation_tokens".to_string()].into_iter().collect()
}

fn scheduler(
    store: &Arc<dyn ScheduleStore>,
    dispatcher: &Arc<RecordingDispatcher>,
    clock: &Arc<ManualClock>,
) -> PeriodicScheduler {
    PeriodicScheduler::new(SchedulerConfig::default(), store.clone(), dispatcher.clone())
        .with_clock(clock.clone())
}

/// Move wall and monotonic clocks together.
async fn advance(clock: &ManualClock, by: u64) {
    clock.advance(Duration::from_secs(by));
    tokio::time::advance(Duration::from_secs(by)).await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_mid_interval_does_not_fire_early() {
    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let clock = Arc::new(ManualClock::new(t0()));

    let first = scheduler(&store, &dispatcher, &clock);
    first.sync_entries(&[every("cleanup", 60)], &catalog()).await.unwrap();
    let report = first.tick().await.unwrap();
    assert_eq!(report.fired.len(), 1);
    drop(first);

    // Restart 30s later: config is re-synced and nothing fires until t=60
    advance(&clock, 30).await;
    let second = scheduler(&store, &dispatcher, &clock);
    second.sync_entries(&[every("cleanup", 60)], &catalog()).await.unwrap();
    assert!(second.tick().await.unwrap().fired.is_empty());

    advance(&clock, 29).await;
    assert!(second.tick().await.unwrap().fired.is_empty());

    advance(&clock, 1).await;
    assert_eq!(second.tick().await.unwrap().fired.len(), 1);
    assert_eq!(dispatcher.count(), 2);
    assert_eq!(store.get("cleanup").await.unwrap().unwrap().last_fired_at, Some(secs(60)));
}

#[tokio::test(start_paused = true)]
async fn test_late_ticks_do_not_accumulate_drift() {
    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let clock = Arc::new(ManualClock::new(t0()));
    let s = scheduler(&store, &dispatcher, &clock);
    s.sync_entries(&[every("cleanup", 60)], &catalog()).await.unwrap();

    s.tick().await.unwrap();
    advance(&clock, 67).await;
    assert_eq!(s.tick().await.unwrap().fired.len(), 1);
    assert_eq!(store.get("cleanup").await.unwrap().unwrap().last_fired_at, Some(secs(60)));

    // 53s after the late fire, but 60s after its window
    advance(&clock, 53).await;
    assert_eq!(s.tick().await.unwrap().fired.len(), 1);
    assert_eq!(store.get("cleanup").await.unwrap().unwrap().last_fired_at, Some(secs(120)));
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_jump_cannot_double_fire() {
    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let clock = Arc::new(ManualClock::new(t0()));
    let s = scheduler(&store, &dispatcher, &clock);
    s.sync_entries(&[every("cleanup", 60)], &catalog()).await.unwrap();

    s.tick().await.unwrap();

    // Wall clock leaps an hour, monotonic time barely moves
    clock.advance(Duration::from_secs(3600));
    tokio::time::advance(Duration::from_secs(1)).await;
    let report = s.tick().await.unwrap();
    assert!(report.fired.is_empty());
    assert_eq!(report.held_back, vec!["cleanup"]);
    assert_eq!(dispatcher.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_misfire_restores_window_for_next_tick() {
    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let clock = Arc::new(ManualClock::new(t0()));
    let s = scheduler(&store, &dispatcher, &clock);
    s.sync_entries(&[every("cleanup", 60)], &catalog()).await.unwrap();
    s.tick().await.unwrap();

    advance(&clock, 60).await;
    dispatcher.failing.store(true, Ordering::SeqCst);
    let report = s.tick().await.unwrap();
    assert_eq!(report.misfired, vec!["cleanup"]);
    assert_eq!(store.get("cleanup").await.unwrap().unwrap().last_fired_at, Some(t0()));

    advance(&clock, 1).await;
    dispatcher.failing.store(false, Ordering::SeqCst);
    let report = s.tick().await.unwrap();
    assert_eq!(report.fired.len(), 1);
    assert_eq!(store.get("cleanup").await.unwrap().unwrap().last_fired_at, Some(secs(60)));
}

#[tokio::test(start_paused = true)]
async fn test_cron_entry_baselines_then_fires_on_occurrence() {
    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let clock = Arc::new(ManualClock::new(secs(30)));
    let s = scheduler(&store, &dispatcher, &clock);
    let entry = ScheduleEntry::new(
        "hourly",
        "delete_expired_activation_tokens",
        Trigger::cron("0 * * * *").unwrap(),
    );
    s.sync_entries(&[entry], &catalog()).await.unwrap();

    let report = s.tick().await.unwrap();
    assert_eq!(report.baselined, vec!["hourly"]);
    assert!(report.fired.is_empty());

    advance(&clock, 3_500).await;
    assert!(s.tick().await.unwrap().fired.is_empty());

    advance(&clock, 100).await;
    assert_eq!(s.tick().await.unwrap().fired.len(), 1);
    assert_eq!(store.get("hourly").await.unwrap().unwrap().last_fired_at, Some(secs(3600)));
}

#[tokio::test]
async fn test_unknown_task_rejected_at_startup() {
    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let clock = Arc::new(ManualClock::new(t0()));
    let s = scheduler(&store, &dispatcher, &clock);

    let bad = ScheduleEntry::new("typo", "delete_expird_tokens", Trigger::interval(Duration::from_secs(5)).unwrap());
    let result = s.sync_entries(&[every("ok", 5), bad], &catalog()).await;
    assert!(matches!(result, Err(SchedulerError::UnknownTask { .. })));
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_disabled_entries_are_skipped() {
    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let clock = Arc::new(ManualClock::new(t0()));
    let s = scheduler(&store, &dispatcher, &clock);
    s.sync_entries(&[every("cleanup", 60)], &catalog()).await.unwrap();

    assert!(store.set_enabled("cleanup", false).await.unwrap());
    assert!(s.tick().await.unwrap().fired.is_empty());
    assert!(!store.set_enabled("missing", false).await.unwrap());
}

#[tokio::test]
async fn test_fired_task_lands_in_queue_once_per_window() {
    let broker = Arc::new(MemoryBroker::new(Duration::from_secs(30)));
    let results = Arc::new(MemoryResultStore::new());
    let producer = Arc::new(TaskProducer::new(broker.clone(), results, ProducerConfig::default()));

    let clock = Arc::new(ManualClock::new(t0()));
    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let s = PeriodicScheduler::new(SchedulerConfig::default(), store.clone(), producer.clone())
        .with_clock(clock.clone());
    s.sync_entries(&[every("cleanup", 60)], &catalog()).await.unwrap();

    let report = s.tick().await.unwrap();
    let (_, id) = report.fired[0].clone();

    // Another instance that never saw the persisted window fires the same window again
    store.set_last_fired("cleanup", None).await.unwrap();
    let other = PeriodicScheduler::new(SchedulerConfig::default(), store.clone(), producer)
        .with_clock(clock.clone());
    let again = other.tick().await.unwrap();
    assert_eq!(again.fired, vec![("cleanup".to_string(), id)]);

    let delivery = broker.try_dequeue("default").await.unwrap().unwrap();
    assert_eq!(delivery.message.id, id);
    assert_eq!(delivery.message.task_name, "delete_expired_activation_tokens");
    assert!(broker.try_dequeue("default").await.unwrap().is_none());
}

#[tokio::test]
async fn test_only_the_leader_fires() {
    let lease = Arc::new(MemoryLease::new());
    let election = |id: &str| {
        Arc::new(
            LeaderElection::new(
                LeaderElectionConfig::default().with_instance_id(id),
                lease.clone(),
            )
            .unwrap(),
        )
    };
    let leader = election("a");
    let standby = election("b");
    leader.tick().await;
    standby.tick().await;

    let store: Arc<dyn ScheduleStore> = Arc::new(MemoryScheduleStore::new());
    let config = SchedulerConfig {
        enabled: true,
        tick_interval: Duration::from_millis(20),
    };

    let standby_dispatch = Arc::new(RecordingDispatcher::default());
    let standby_scheduler = Arc::new(PeriodicScheduler::new(config.clone(), store.clone(), standby_dispatch.clone()));
    standby_scheduler.sync_entries(&[every("cleanup", 3600)], &catalog()).await.unwrap();
    standby_scheduler.start(StandbyGuard::new(standby)).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(standby_dispatch.count(), 0);

    let leader_dispatch = Arc::new(RecordingDispatcher::default());
    let leader_scheduler = Arc::new(PeriodicScheduler::new(config, store.clone(), leader_dispatch.clone()));
    leader_scheduler.start(StandbyGuard::new(leader)).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(leader_dispatch.count(), 1);
    assert_eq!(standby_dispatch.count(), 0);

    leader_scheduler.stop().await;
    standby_scheduler.stop().await;
    assert!(!leader_scheduler.is_running().await);
}

#[tokio::test]
async fn test_sqlite_store_preserves_last_fired_on_upsert() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteScheduleStore::new(pool);
    store.init_schema().await.unwrap();

    let mut entry = every("cleanup", 60);
    entry.kwargs.insert("older_than_days".into(), serde_json::json!(7));
    store.upsert(&entry).await.unwrap();
    store.set_last_fired("cleanup", Some(secs(120))).await.unwrap();

    // redeploy with a new period
    let mut changed = every("cleanup", 90);
    changed.queue = Some("maintenance".into());
    store.upsert(&changed).await.unwrap();

    let stored = store.get("cleanup").await.unwrap().unwrap();
    assert_eq!(stored.last_fired_at, Some(secs(120)));
    assert_eq!(stored.trigger.period(), Some(Duration::from_secs(90)));
    assert_eq!(stored.queue.as_deref(), Some("maintenance"));
    assert!(stored.kwargs.is_empty());

    let cron = ScheduleEntry::new("nightly", "delete_expired_activation_tokens", Trigger::cron("0 3 * * *").unwrap());
    store.upsert(&cron).await.unwrap();
    let names: Vec<String> = store.list().await.unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["cleanup", "nightly"]);

    assert!(store.remove("nightly").await.unwrap());
    assert!(!store.remove("nightly").await.unwrap());
}
