//! Backlot Worker
//!
//! Pulls tasks from the configured queues and runs them. Every task name in
//! `[[integrations]]` is forwarded to its HTTP endpoint; the result purge task
//! is always registered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bl_config::{AppConfig, ConfigLoader, PURGE_EXPIRED_RESULTS_TASK};
use bl_worker::{
    Backends, Executor, IntegrationTask, PurgeExpiredResultsTask, TaskRegistry, WorkerPool, WorkerPoolConfig,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bl-worker")]
#[command(about = "Backlot worker - executes queued tasks")]
struct Args {
    /// Config file (searched in the usual locations when omitted)
    #[arg(long, env = "BACKLOT_CONFIG")]
    config: Option<String>,

    /// Prometheus scrape listener
    #[arg(long, env = "BACKLOT_WORKER_METRICS_ADDR", default_value = "0.0.0.0:9101")]
    metrics_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    bl_common::logging::init_logging("bl-worker");
    let args = Args::parse();

    info!("Starting Backlot worker");

    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {e}"))?;
    info!(addr = %args.metrics_addr, "Metrics listener started");

    let backends = Backends::connect(&config).await?;
    let registry = Arc::new(build_registry(&config, &backends)?);

    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let worker_id = if config.worker.worker_id.is_empty() {
        format!("{hostname}-{}", std::process::id())
    } else {
        config.worker.worker_id.clone()
    };

    let executor = Arc::new(Executor::new(
        backends.broker.clone(),
        backends.results.clone(),
        registry,
        worker_id.clone(),
        Duration::from_secs(config.worker.task_timeout_secs),
        Duration::from_secs(config.results.result_ttl_secs),
    ));

    let pool_config = WorkerPoolConfig {
        worker_id,
        hostname,
        queues: config.worker.queues.clone(),
        concurrency: config.worker.concurrency,
        starvation_limit: config.worker.starvation_limit,
        heartbeat_interval: Duration::from_secs(config.worker.heartbeat_interval_secs),
        stale_after: Duration::from_secs(config.worker.stale_after_secs),
        shutdown_grace: Duration::from_secs(config.worker.shutdown_grace_secs),
        fetch_backoff_max: Duration::from_millis(config.worker.fetch_backoff_max_ms),
    };
    let pool = Arc::new(WorkerPool::new(
        pool_config,
        backends.broker.clone(),
        backends.workers.clone(),
        executor,
    )?);

    let mut runner = tokio::spawn(pool.clone().run());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining in-flight tasks");
            pool.shutdown();
            match runner.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Worker pool stopped with error"),
                Err(e) => error!(error = %e, "Worker pool task failed"),
            }
        }
        joined = &mut runner => {
            match joined {
                Ok(Ok(())) => info!("Worker pool exited"),
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(anyhow::anyhow!("worker pool task failed: {e}")),
            }
        }
    }

    info!("Backlot worker stopped");
    Ok(())
}

fn build_registry(config: &AppConfig, backends: &Backends) -> Result<TaskRegistry> {
    let mut registry = TaskRegistry::new();
    for integration in &config.integrations {
        let task = IntegrationTask::http(&integration.endpoint, Duration::from_secs(integration.timeout_secs))?;
        registry.register(&integration.task, Arc::new(task))?;
        info!(task = %integration.task, endpoint = %integration.endpoint, "Registered integration task");
    }
    registry.register(
        PURGE_EXPIRED_RESULTS_TASK,
        Arc::new(PurgeExpiredResultsTask::new(backends.results.clone())),
    )?;
    Ok(registry)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
