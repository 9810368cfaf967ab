//! Storage wiring shared by the worker, scheduler and monitor processes.

use std::sync::Arc;
use std::time::Duration;

use bl_broker::{
    connect_sqlite, Broker, MemoryBroker, MemoryWorkerRegistry, SqliteBroker, SqliteWorkerRegistry,
    WorkerRegistry,
};
use bl_config::{AppConfig, BrokerConfig};
use bl_results::{MemoryResultStore, ResultStore, SqliteResultStore};
use tracing::{info, warn};

use crate::producer::ProducerConfig;
use crate::{Result, WorkerError};

impl From<&BrokerConfig> for ProducerConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            default_queue: config.default_queue.clone(),
            default_retry: config.default_retry.clone(),
            max_attempts: config.enqueue_max_attempts,
            backoff: Duration::from_millis(config.enqueue_backoff_ms),
            backoff_max: Duration::from_millis(config.enqueue_backoff_max_ms),
            ..Default::default()
        }
    }
}

impl From<&AppConfig> for ProducerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            result_ttl: Duration::from_secs(config.results.result_ttl_secs),
            ..Self::from(&config.broker)
        }
    }
}

/// Broker, worker registry and result store selected by `broker.backend`.
#[derive(Clone)]
pub struct Backends {
    pub broker: Arc<dyn Broker>,
    pub workers: Arc<dyn WorkerRegistry>,
    pub results: Arc<dyn ResultStore>,
}

impl Backends {
    /// Connect and create schemas. The result store shares the broker
    /// database unless `results.database_url` is set.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        match config.broker.backend.as_str() {
            "memory" => {
                warn!("Using in-memory broker; tasks do not survive a restart and are not shared between processes");
                Ok(Self::in_memory(config.broker.visibility_timeout()))
            }
            "sqlite" => {
                let broker_cfg = &config.broker;
                let pool = connect_sqlite(&broker_cfg.database_url, broker_cfg.max_connections).await?;

                let broker = SqliteBroker::new(pool.clone(), broker_cfg.visibility_timeout(), broker_cfg.poll_interval());
                broker.init_schema().await?;
                let workers = SqliteWorkerRegistry::new(pool.clone());
                workers.init_schema().await?;

                let results_url = config.results_database_url();
                let results_pool = if results_url == broker_cfg.database_url {
                    pool
                } else {
                    connect_sqlite(results_url, broker_cfg.max_connections).await?
                };
                let results = SqliteResultStore::new(results_pool);
                results.init_schema().await?;

                info!(broker = %broker_cfg.database_url, results = %results_url, "Connected to SQLite storage");
                Ok(Self {
                    broker: Arc::new(broker),
                    workers: Arc::new(workers),
                    results: Arc::new(results),
                })
            }
            other => Err(WorkerError::Config(format!("unknown broker backend '{other}'"))),
        }
    }

    pub fn in_memory(visibility_timeout: Duration) -> Self {
        Self {
            broker: Arc::new(MemoryBroker::new(visibility_timeout)),
            workers: Arc::new(MemoryWorkerRegistry::new()),
            results: Arc::new(MemoryResultStore::new()),
        }
    }
}
