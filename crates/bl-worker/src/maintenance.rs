//! Built-in housekeeping tasks.

use std::sync::Arc;

use async_trait::async_trait;
use bl_results::ResultStore;
use serde_json::{json, Value};
use tracing::info;

use crate::task::{TaskContext, TaskError, TaskHandler};

/// Sweeps expired task records out of the result store.
pub struct PurgeExpiredResultsTask {
    results: Arc<dyn ResultStore>,
}

impl PurgeExpiredResultsTask {
    pub fn new(results: Arc<dyn ResultStore>) -> Self {
        Self { results }
    }
}

#[async_trait]
impl TaskHandler for PurgeExpiredResultsTask {
    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let purged = self
            .results
            .purge_expired()
            .await
            .map_err(|e| TaskError::Transient(e.to_string()))?;
        info!(task_id = %ctx.task_id(), purged, "Expired results purged");
        Ok(json!({ "purged": purged }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bl_common::{TaskMessage, TaskOutcome};
    use bl_results::MemoryResultStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_purges_expired_records() {
        let store = Arc::new(MemoryResultStore::new());
        let message = TaskMessage::new("t", "default");
        store.record_pending(&message).await.unwrap();
        store
            .put(message.id, &TaskOutcome::success(json!(1), 0), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let task = PurgeExpiredResultsTask::new(store.clone());
        let ctx = TaskContext::new(TaskMessage::new("purge", "default"), "w1");
        assert_eq!(task.run(ctx).await.unwrap(), json!({ "purged": 1 }));
        assert!(store.is_empty());
    }
}
