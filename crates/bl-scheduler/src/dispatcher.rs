//! Where fired entries go.

use async_trait::async_trait;
use bl_common::TaskRequest;
use bl_worker::TaskProducer;
use uuid::Uuid;

use crate::{Result, SchedulerError};

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, request: TaskRequest) -> Result<Uuid>;
}

#[async_trait]
impl TaskDispatcher for TaskProducer {
    async fn dispatch(&self, request: TaskRequest) -> Result<Uuid> {
        self.send(request)
            .await
            .map_err(|e| SchedulerError::Dispatch(e.to_string()))
    }
}
