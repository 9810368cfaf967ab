//! Backlot Periodic Scheduler Server
//!
//! Runs on every scheduler node; only the instance holding the leader lease
//! fires entries. Standbys keep ticking their election and take over when the
//! lease lapses.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use bl_config::{AppConfig, ConfigLoader};
use bl_scheduler::{
    MemoryScheduleStore, PeriodicScheduler, ScheduleEntry, ScheduleStore, SchedulerConfig, SqliteScheduleStore,
    TaskDispatcher,
};
use bl_standby::{LeaderElection, LeaderElectionConfig, LeadershipStatus, MemoryLease, StandbyGuard};
use bl_worker::{Backends, ProducerConfig, TaskProducer};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tokio::{net::TcpListener, signal};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bl-scheduler-server")]
#[command(about = "Backlot periodic scheduler")]
struct Args {
    /// Config file (searched in the usual locations when omitted)
    #[arg(long, env = "BACKLOT_CONFIG")]
    config: Option<String>,

    /// Health and metrics listener
    #[arg(long, env = "BACKLOT_SCHEDULER_ADDR", default_value = "0.0.0.0:8091")]
    addr: SocketAddr,
}

#[derive(Clone)]
struct AppState {
    scheduler: Arc<PeriodicScheduler>,
    election: Arc<LeaderElection>,
    metrics: PrometheusHandle,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    scheduler_running: bool,
    leader: bool,
    leadership: String,
    instance_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    bl_common::logging::init_logging("bl-scheduler-server");
    let args = Args::parse();

    info!("Starting Backlot periodic scheduler");

    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };
    info!(
        enabled = config.scheduler.enabled,
        tick_interval_ms = config.scheduler.tick_interval_ms,
        entries = config.scheduler.entries.len(),
        "Scheduler configuration loaded"
    );

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))?;

    let backends = Backends::connect(&config).await?;
    let catalog: HashSet<String> = config.task_catalog().into_iter().collect();
    let producer = TaskProducer::new(
        backends.broker.clone(),
        backends.results.clone(),
        ProducerConfig::from(&config),
    )
    .with_known_tasks(catalog.iter().cloned());
    let dispatcher: Arc<dyn TaskDispatcher> = Arc::new(producer);

    let store = schedule_store(&config).await?;
    let scheduler = Arc::new(PeriodicScheduler::new(
        SchedulerConfig::from(&config.scheduler),
        store,
        dispatcher,
    ));

    // A bad definition stops startup before anything is written
    let entries = config
        .scheduler
        .entries
        .iter()
        .map(ScheduleEntry::from_config)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    scheduler.sync_entries(&entries, &catalog).await?;

    let election = Arc::new(leader_election(&config).await?);
    election.clone().start()?;
    scheduler.start(StandbyGuard::new(election.clone())).await;

    let state = AppState {
        scheduler: scheduler.clone(),
        election: election.clone(),
        metrics,
    };
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/q/health", get(health_handler))
        .route("/q/health/live", get(|| async { Json(serde_json::json!({"status": "UP"})) }))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(addr = %args.addr, "HTTP server starting");
    let listener = TcpListener::bind(args.addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown signal received");
    scheduler.stop().await;
    election.shutdown().await;

    info!("Scheduler server stopped");
    Ok(())
}

async fn schedule_store(config: &AppConfig) -> Result<Arc<dyn ScheduleStore>> {
    if config.broker.backend == "memory" {
        warn!("Using in-memory schedule store; last-fired times are lost on restart");
        return Ok(Arc::new(MemoryScheduleStore::new()));
    }
    let pool = bl_broker::connect_sqlite(&config.broker.database_url, config.broker.max_connections).await?;
    let store = SqliteScheduleStore::new(pool);
    store.init_schema().await?;
    Ok(Arc::new(store))
}

async fn leader_election(config: &AppConfig) -> Result<LeaderElection> {
    let leader = &config.leader;
    let mut election_config = LeaderElectionConfig::default()
        .with_lock_key(&leader.lock_key)
        .with_ttl(Duration::from_secs(leader.ttl_secs))
        .with_refresh_interval(Duration::from_millis(leader.refresh_interval_ms));
    if !leader.instance_id.is_empty() {
        election_config = election_config.with_instance_id(&leader.instance_id);
    }

    let election = match leader.backend.as_str() {
        "redis" => {
            info!(redis_url = %leader.redis_url, lock_key = %leader.lock_key, "Using Redis leader lease");
            LeaderElection::redis(election_config, &leader.redis_url).await?
        }
        "memory" => {
            warn!("Using in-process leader lease; run a single scheduler instance only");
            LeaderElection::new(election_config, Arc::new(MemoryLease::new()))?
        }
        other => anyhow::bail!("unknown leader.backend '{other}'"),
    };
    Ok(election)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.scheduler.is_running().await;
    let leadership = state.election.status();
    let status = if running && leadership != LeadershipStatus::Unknown {
        "UP"
    } else {
        "DOWN"
    };
    let code = if status == "UP" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status,
        scheduler_running: running,
        leader: state.election.is_leader(),
        leadership: format!("{leadership:?}"),
        instance_id: state.election.instance_id().to_string(),
    };
    (code, Json(body))
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
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
