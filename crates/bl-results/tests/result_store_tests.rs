//! Behaviour shared by every result store backend.

use std::sync::Arc;
use std::time::Duration;

use bl_common::{TaskMessage, TaskOutcome, TaskState};
use bl_results::{
    MemoryResultStore, ResultStore, RevokeOutcome, SqliteResultStore, StartDecision, TaskLookup,
};
use chrono::Utc;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

const TTL: Duration = Duration::from_secs(3600);

async fn backends() -> Vec<(&'static str, Arc<dyn ResultStore>)> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let sqlite = SqliteResultStore::new(pool);
    sqlite.init_schema().await.unwrap();

    vec![
        ("sqlite", Arc::new(sqlite) as Arc<dyn ResultStore>),
        ("memory", Arc::new(MemoryResultStore::new())),
    ]
}

#[tokio::test]
async fn test_lifecycle_pending_started_success() {
    for (name, store) in backends().await {
        let message = TaskMessage::new("send_activation_email", "default");
        store.record_pending(&message).await.unwrap();
        assert_eq!(store.get(message.id).await.unwrap().state(), TaskState::Pending, "{name}");

        let decision = store.mark_started(&message, "worker-1").await.unwrap();
        assert_eq!(decision, StartDecision::Proceed, "{name}");
        let lookup = store.get(message.id).await.unwrap();
        assert_eq!(lookup.state(), TaskState::Started, "{name}");
        assert_eq!(lookup.record().unwrap().worker_id.as_deref(), Some("worker-1"), "{name}");

        let outcome = TaskOutcome::success(json!({"sent": true}), 0).by_worker("worker-1");
        store.put(message.id, &outcome, TTL).await.unwrap();

        match store.get(message.id).await.unwrap() {
            TaskLookup::Complete(record) => {
                assert_eq!(record.state, TaskState::Success, "{name}");
                assert_eq!(record.result, Some(json!({"sent": true})), "{name}");
                assert_eq!(record.task_name, "send_activation_email", "{name}");
                assert!(record.finished_at.is_some(), "{name}");
            }
            other => panic!("{name}: expected complete, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_second_put_wins_entirely() {
    for (name, store) in backends().await {
        let message = TaskMessage::new("t", "default");
        store.record_pending(&message).await.unwrap();

        store
            .put(message.id, &TaskOutcome::dead_letter("boom", 3), TTL)
            .await
            .unwrap();
        store
            .put(message.id, &TaskOutcome::success(json!(42), 1), TTL)
            .await
            .unwrap();

        let record = store.get(message.id).await.unwrap().record().cloned().unwrap();
        assert_eq!(record.state, TaskState::Success, "{name}");
        assert_eq!(record.result, Some(json!(42)), "{name}");
        assert_eq!(record.error, None, "{name}");
        assert_eq!(record.retries, 1, "{name}");
    }
}

#[tokio::test]
async fn test_put_rejects_non_terminal_state() {
    for (name, store) in backends().await {
        let mut outcome = TaskOutcome::success(json!(null), 0);
        outcome.state = TaskState::Started;
        assert!(store.put(uuid::Uuid::new_v4(), &outcome, TTL).await.is_err(), "{name}");
    }
}

#[tokio::test]
async fn test_expired_result_is_never_served() {
    for (name, store) in backends().await {
        let message = TaskMessage::new("t", "default");
        store.record_pending(&message).await.unwrap();
        store
            .put(message.id, &TaskOutcome::success(json!(1), 0), Duration::from_millis(50))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let lookup = store.get(message.id).await.unwrap();
        assert_eq!(lookup, TaskLookup::NotComplete(None), "{name}");
        assert_eq!(lookup.state(), TaskState::Pending, "{name}");
    }
}

#[tokio::test]
async fn test_unknown_id_reads_as_pending() {
    for (name, store) in backends().await {
        let lookup = store.get(uuid::Uuid::new_v4()).await.unwrap();
        assert_eq!(lookup.state(), TaskState::Pending, "{name}");
        assert!(lookup.record().is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_revoke_before_start_skips_execution() {
    for (name, store) in backends().await {
        let message = TaskMessage::new("t", "default");
        store.record_pending(&message).await.unwrap();

        assert_eq!(store.request_revoke(message.id).await.unwrap(), RevokeOutcome::Flagged, "{name}");
        assert!(store.is_revoked(message.id).await.unwrap(), "{name}");

        let decision = store.mark_started(&message, "worker-1").await.unwrap();
        assert_eq!(decision, StartDecision::Revoked, "{name}");
        // the flag alone does not change state
        assert_eq!(store.get(message.id).await.unwrap().state(), TaskState::Pending, "{name}");
    }
}

#[tokio::test]
async fn test_revoke_after_start_or_finish() {
    for (name, store) in backends().await {
        let started = TaskMessage::new("t", "default");
        store.record_pending(&started).await.unwrap();
        store.mark_started(&started, "w").await.unwrap();
        assert_eq!(
            store.request_revoke(started.id).await.unwrap(),
            RevokeOutcome::AlreadyStarted,
            "{name}"
        );

        let finished = TaskMessage::new("t", "default");
        store.record_pending(&finished).await.unwrap();
        store
            .put(finished.id, &TaskOutcome::success(json!(null), 0), TTL)
            .await
            .unwrap();
        assert_eq!(
            store.request_revoke(finished.id).await.unwrap(),
            RevokeOutcome::AlreadyTerminal(TaskState::Success),
            "{name}"
        );

        assert_eq!(
            store.request_revoke(uuid::Uuid::new_v4()).await.unwrap(),
            RevokeOutcome::NotFound,
            "{name}"
        );
    }
}

#[tokio::test]
async fn test_redelivery_of_finished_task_is_reported() {
    for (name, store) in backends().await {
        let message = TaskMessage::new("t", "default");
        store.record_pending(&message).await.unwrap();
        store.mark_started(&message, "w").await.unwrap();
        store
            .put(message.id, &TaskOutcome::success(json!(null), 0), TTL)
            .await
            .unwrap();

        let decision = store.mark_started(&message, "w2").await.unwrap();
        assert_eq!(decision, StartDecision::AlreadyFinished(TaskState::Success), "{name}");
    }
}

#[tokio::test]
async fn test_mark_started_without_pending_record() {
    for (name, store) in backends().await {
        let message = TaskMessage::new("t", "default");
        let decision = store.mark_started(&message, "w").await.unwrap();
        assert_eq!(decision, StartDecision::Proceed, "{name}");
        assert_eq!(store.get(message.id).await.unwrap().state(), TaskState::Started, "{name}");
    }
}

#[tokio::test]
async fn test_failure_then_retry_tracks_retries() {
    for (name, store) in backends().await {
        let message = TaskMessage::new("t", "default");
        store.record_pending(&message).await.unwrap();
        store.mark_started(&message, "w").await.unwrap();

        store.record_failure(message.id, 0, "connection reset").await.unwrap();
        assert_eq!(store.get(message.id).await.unwrap().state(), TaskState::Failure, "{name}");

        store.record_retry(message.id, 1, "connection reset").await.unwrap();
        let record = store.get(message.id).await.unwrap().record().cloned().unwrap();
        assert_eq!(record.state, TaskState::Retry, "{name}");
        assert_eq!(record.retries, 1, "{name}");
        assert_eq!(record.error.as_deref(), Some("connection reset"), "{name}");
        assert!(record.worker_id.is_none(), "{name}");

        // a retrying task can still be revoked
        assert_eq!(store.request_revoke(message.id).await.unwrap(), RevokeOutcome::Flagged, "{name}");
    }
}

#[tokio::test]
async fn test_state_histogram_counts_recent_records() {
    for (name, store) in backends().await {
        let since = Utc::now() - chrono::Duration::seconds(5);
        for _ in 0..3 {
            store.record_pending(&TaskMessage::new("t", "default")).await.unwrap();
        }
        let done = TaskMessage::new("t", "default");
        store.record_pending(&done).await.unwrap();
        store
            .put(done.id, &TaskOutcome::dead_letter("nope", 3), TTL)
            .await
            .unwrap();

        let histogram = store.state_histogram(since).await.unwrap();
        assert_eq!(histogram.get(&TaskState::Pending), Some(&3), "{name}");
        assert_eq!(histogram.get(&TaskState::DeadLetter), Some(&1), "{name}");
        assert_eq!(histogram.get(&TaskState::Success), None, "{name}");

        let later = store.state_histogram(Utc::now() + chrono::Duration::seconds(5)).await.unwrap();
        assert!(later.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_purge_expired() {
    for (name, store) in backends().await {
        let short = TaskMessage::new("t", "default");
        let long = TaskMessage::new("t", "default");
        store.record_pending(&short).await.unwrap();
        store.record_pending(&long).await.unwrap();
        store
            .put(short.id, &TaskOutcome::success(json!(1), 0), Duration::from_millis(20))
            .await
            .unwrap();
        store
            .put(long.id, &TaskOutcome::success(json!(2), 0), TTL)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1, "{name}");
        assert_eq!(store.purge_expired().await.unwrap(), 0, "{name}");
        assert_eq!(store.get(long.id).await.unwrap().state(), TaskState::Success, "{name}");
    }
}

#[tokio::test]
async fn test_expired_id_can_be_recorded_again() {
    for (name, store) in backends().await {
        let message = TaskMessage::new("t", "default");
        store.record_pending(&message).await.unwrap();
        store
            .put(message.id, &TaskOutcome::revoked(0), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        store.record_pending(&message).await.unwrap();
        let record = store.get(message.id).await.unwrap().record().cloned().unwrap();
        assert_eq!(record.state, TaskState::Pending, "{name}");
        assert!(!record.revoke_requested, "{name}");
    }
}
