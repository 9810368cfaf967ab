//! Outbound integrations (mail, payments, storage) behind an opaque client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::task::{TaskContext, TaskError, TaskHandler};
use crate::{Result, WorkerError};

/// Body sent to an integration endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrationPayload {
    pub task_id: Uuid,
    pub task_name: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub attempt: u32,
}

impl From<&TaskContext> for IntegrationPayload {
    fn from(ctx: &TaskContext) -> Self {
        Self {
            task_id: ctx.message.id,
            task_name: ctx.message.task_name.clone(),
            args: ctx.message.args.clone(),
            kwargs: ctx.message.kwargs.clone(),
            attempt: ctx.attempt,
        }
    }
}

#[async_trait]
pub trait IntegrationClient: Send + Sync {
    async fn send(&self, payload: &IntegrationPayload) -> std::result::Result<Value, TaskError>;
}

/// POSTs the payload as JSON and classifies the response.
pub struct HttpIntegrationClient {
    client: Client,
    endpoint: String,
}

impl HttpIntegrationClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| WorkerError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// 2xx succeeds; 408, 429 and 5xx are retryable; any other 4xx is permanent.
fn classify(status: StatusCode) -> std::result::Result<(), TaskError> {
    let code = status.as_u16();
    if status.is_success() {
        Ok(())
    } else if code == 408 || code == 429 || status.is_server_error() {
        Err(TaskError::Transient(format!("HTTP {code}")))
    } else if status.is_client_error() {
        Err(TaskError::Permanent(format!("HTTP {code}")))
    } else {
        Err(TaskError::Transient(format!("HTTP {code}: unexpected status")))
    }
}

#[async_trait]
impl IntegrationClient for HttpIntegrationClient {
    async fn send(&self, payload: &IntegrationPayload) -> std::result::Result<Value, TaskError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    warn!(task_id = %payload.task_id, endpoint = %self.endpoint, "Integration request timed out");
                    TaskError::Transient("request timeout".to_string())
                } else if e.is_connect() {
                    warn!(task_id = %payload.task_id, endpoint = %self.endpoint, error = %e, "Integration connection error");
                    TaskError::Transient(format!("connection error: {e}"))
                } else {
                    warn!(task_id = %payload.task_id, endpoint = %self.endpoint, error = %e, "Integration request failed");
                    TaskError::Transient(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        classify(status)?;

        let body = response
            .text()
            .await
            .map_err(|e| TaskError::Transient(format!("failed to read response: {e}")))?;
        debug!(task_id = %payload.task_id, status = status.as_u16(), "Integration call succeeded");

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}

/// Task handler that forwards the task to an integration client.
pub struct IntegrationTask {
    client: Arc<dyn IntegrationClient>,
}

impl IntegrationTask {
    pub fn new(client: Arc<dyn IntegrationClient>) -> Self {
        Self { client }
    }

    pub fn http(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self::new(Arc::new(HttpIntegrationClient::new(endpoint, timeout)?)))
    }
}

#[async_trait]
impl TaskHandler for IntegrationTask {
    async fn run(&self, ctx: TaskContext) -> std::result::Result<Value, TaskError> {
        let payload = IntegrationPayload::from(&ctx);
        self.client.send(&payload).await
    }
}
