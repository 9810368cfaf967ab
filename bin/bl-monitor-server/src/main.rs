//! Backlot Monitoring Server
//!
//! Task submission and status, queue depths, dead letters, worker heartbeats
//! and the state histogram. OpenAPI docs are served at `/swagger-ui`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use bl_common::CredentialStore;
use bl_config::{AppConfig, ConfigLoader};
use bl_monitor::{MonitorSettings, MonitorState};
use bl_worker::{Backends, ProducerConfig, TaskProducer};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bl-monitor-server")]
#[command(about = "Backlot monitoring and task API")]
struct Args {
    /// Config file (searched in the usual locations when omitted)
    #[arg(long, env = "BACKLOT_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    bl_common::logging::init_logging("bl-monitor-server");
    let args = Args::parse();

    info!("Starting Backlot monitoring server");

    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))?;

    let backends = Backends::connect(&config).await?;
    let credentials = CredentialStore::from_hashes(config.credentials.clone())?;
    let settings = monitor_settings(&config, &credentials);

    let producer = TaskProducer::new(
        backends.broker.clone(),
        backends.results.clone(),
        ProducerConfig::from(&config),
    )
    .with_known_tasks(config.task_catalog());

    let state = MonitorState::new(
        backends.broker,
        backends.workers,
        backends.results,
        producer,
        credentials,
        settings,
    )
    .with_metrics(metrics);
    let app = bl_monitor::router(state);

    let addr: SocketAddr = format!("{}:{}", config.monitor.host, config.monitor.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid monitor listen address: {e}"))?;
    info!(%addr, "HTTP server starting");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Monitoring server stopped");
    Ok(())
}

fn monitor_settings(config: &AppConfig, credentials: &CredentialStore) -> MonitorSettings {
    let admin_users: HashSet<String> = config.monitor.admin_users.iter().cloned().collect();
    for user in &admin_users {
        if !credentials.contains(user) {
            warn!(username = %user, "Admin user has no credentials and cannot authenticate");
        }
    }

    let mut known_queues = config.worker.queues.clone();
    if !known_queues.contains(&config.broker.default_queue) {
        known_queues.push(config.broker.default_queue.clone());
    }

    MonitorSettings {
        admin_users,
        stale_after: Duration::from_secs(config.worker.stale_after_secs),
        histogram_window: Duration::from_secs(config.monitor.histogram_window_secs),
        known_queues,
    }
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
