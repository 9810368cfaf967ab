//! Backlot Monitoring Service
//!
//! HTTP API over the broker, worker registry and result store:
//! - task enqueue and result lookup
//! - queue depths, dead letters, worker heartbeats, state histogram
//! - admin-only revoke and dead-letter purge
//!
//! The service never executes or retries tasks. Revoking only sets the flag a
//! worker checks before it starts a task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bl_broker::{Broker, WorkerRegistry};
use bl_common::CredentialStore;
use bl_results::ResultStore;
use bl_worker::TaskProducer;
use metrics_exporter_prometheus::PrometheusHandle;

pub mod api;
pub mod auth;
pub mod error;

pub use api::{router, ApiDoc};
pub use auth::AdminUser;
pub use error::{ErrorResponse, MonitorError, Result};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Users allowed to revoke tasks and purge dead letters
    pub admin_users: HashSet<String>,
    /// Heartbeat age after which a worker is reported stale
    pub stale_after: Duration,
    /// Histogram window when the request does not name one
    pub histogram_window: Duration,
    /// Queues always reported, even while empty
    pub known_queues: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            admin_users: HashSet::new(),
            stale_after: Duration::from_secs(60),
            histogram_window: Duration::from_secs(3_600),
            known_queues: Vec::new(),
        }
    }
}

/// Shared handler state.
#[derive(Clone)]
pub struct MonitorState {
    pub broker: Arc<dyn Broker>,
    pub workers: Arc<dyn WorkerRegistry>,
    pub results: Arc<dyn ResultStore>,
    pub producer: TaskProducer,
    pub credentials: Arc<CredentialStore>,
    pub settings: Arc<MonitorSettings>,
    pub metrics: Option<PrometheusHandle>,
}

impl MonitorState {
    pub fn new(
        broker: Arc<dyn Broker>,
        workers: Arc<dyn WorkerRegistry>,
        results: Arc<dyn ResultStore>,
        producer: TaskProducer,
        credentials: CredentialStore,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            broker,
            workers,
            results,
            producer,
            credentials: Arc::new(credentials),
            settings: Arc::new(settings),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
