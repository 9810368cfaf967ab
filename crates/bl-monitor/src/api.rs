//! Routes, handlers and the OpenAPI document.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bl_common::{DeadLetter, QueueDepth, TaskRecord, TaskRequest, TaskState, WorkerRecord};
use bl_results::{RevokeOutcome, TaskLookup};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::{AdminUser, ErrorResponse, MonitorError, MonitorState, Result};

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;
const MAX_DEAD_LETTER_LIMIT: usize = 1_000;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    /// UP or DOWN
    pub status: String,
    pub version: String,
    pub broker_healthy: bool,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct EnqueueResponse {
    pub id: Uuid,
}

/// Current state of a task. Unknown and expired ids read as PENDING.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TaskStatusResponse {
    pub id: Uuid,
    pub state: TaskState,
    pub task_name: Option<String>,
    pub queue: Option<String>,
    pub retries: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub revoke_requested: bool,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatusResponse {
    fn from_lookup(id: Uuid, lookup: &TaskLookup) -> Self {
        let record: Option<&TaskRecord> = lookup.record();
        Self {
            id,
            state: lookup.state(),
            task_name: record.map(|r| r.task_name.clone()),
            queue: record.map(|r| r.queue.clone()),
            retries: record.map(|r| r.retries).unwrap_or(0),
            result: record.and_then(|r| r.result.clone()),
            error: record.and_then(|r| r.error.clone()),
            worker_id: record.and_then(|r| r.worker_id.clone()),
            revoke_requested: record.map(|r| r.revoke_requested).unwrap_or(false),
            finished_at: record.and_then(|r| r.finished_at),
        }
    }
}

/// Worker heartbeat as seen by the monitor.
#[derive(Serialize, Deserialize, ToSchema)]
pub struct WorkerStatus {
    pub id: String,
    pub hostname: String,
    pub pid: u32,
    pub queues: Vec<String>,
    pub concurrency: u32,
    pub active_tasks: u32,
    /// Active tasks over concurrency, 0.0 to 1.0
    pub load: f64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub heartbeat_age_secs: f64,
    pub stale: bool,
}

impl WorkerStatus {
    fn new(record: WorkerRecord, now: DateTime<Utc>, stale_after: Duration) -> Self {
        let load = if record.concurrency == 0 {
            0.0
        } else {
            f64::from(record.active_tasks) / f64::from(record.concurrency)
        };
        Self {
            heartbeat_age_secs: record.heartbeat_age(now).as_secs_f64(),
            stale: record.is_stale(now, stale_after),
            id: record.id,
            hostname: record.hostname,
            pid: record.pid,
            queues: record.queues,
            concurrency: record.concurrency,
            active_tasks: record.active_tasks,
            load,
            started_at: record.started_at,
            last_heartbeat: record.last_heartbeat,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct HistogramQuery {
    /// Rolling window in seconds
    pub window_secs: Option<u64>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct HistogramResponse {
    pub window_secs: u64,
    pub since: DateTime<Utc>,
    /// Every state, zero when absent
    pub counts: BTreeMap<String, u64>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct PurgeResponse {
    pub queue: String,
    pub purged: u64,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RevokeResponse {
    pub id: Uuid,
    /// The task keeps its current state until a worker observes the flag
    pub state: TaskState,
    pub revoke_requested: bool,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Backlot Monitoring API",
        version = "0.1.0",
        description = "Task enqueue and lookup, queue and worker monitoring, admin operations"
    ),
    paths(
        health_handler,
        metrics_handler,
        enqueue_task,
        get_task,
        queue_depths,
        list_dead_letters,
        purge_dead_letters,
        list_workers,
        task_histogram,
        revoke_task,
    ),
    components(schemas(
        HealthResponse,
        EnqueueResponse,
        TaskStatusResponse,
        WorkerStatus,
        HistogramResponse,
        PurgeResponse,
        RevokeResponse,
        ErrorResponse,
        TaskRequest,
        QueueDepth,
        DeadLetter,
    )),
    tags(
        (name = "health", description = "Health and metrics"),
        (name = "tasks", description = "Task enqueue and result lookup"),
        (name = "monitoring", description = "Queue, worker and state monitoring"),
        (name = "admin", description = "Operations requiring admin credentials"),
    ),
    modifiers(&BasicAuthScheme)
)]
pub struct ApiDoc;

struct BasicAuthScheme;

impl Modify for BasicAuthScheme {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme("basic_auth", SecurityScheme::Http(Http::new(HttpAuthScheme::Basic)));
        }
    }
}

pub fn router(state: MonitorState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health_handler))
        .route("/q/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/tasks", post(enqueue_task))
        .route("/tasks/{id}", get(get_task))
        .route("/monitoring/queues", get(queue_depths))
        .route(
            "/monitoring/queues/{queue}/dead-letters",
            get(list_dead_letters).delete(purge_dead_letters),
        )
        .route("/monitoring/workers", get(list_workers))
        .route("/monitoring/tasks/histogram", get(task_histogram))
        .route("/monitoring/tasks/{id}/revoke", post(revoke_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Health
// ============================================================================

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
        (status = 503, description = "Broker unreachable", body = HealthResponse)
    )
)]
async fn health_handler(State(state): State<MonitorState>) -> Response {
    let broker_healthy = state.broker.is_healthy();
    let (status, label) = if broker_healthy {
        (StatusCode::OK, "UP")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DOWN")
    };
    let body = HealthResponse {
        status: label.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        broker_healthy,
    };
    (status, Json(body)).into_response()
}

#[utoipa::path(
    get,
    path = "/metrics",
    tag = "health",
    responses(
        (status = 200, description = "Prometheus metrics", content_type = "text/plain")
    )
)]
async fn metrics_handler(State(state): State<MonitorState>) -> Response {
    let output = state.metrics.as_ref().map(|h| h.render()).unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
        .into_response()
}

// ============================================================================
// Tasks
// ============================================================================

/// Enqueue a task. Returns once the message is stored.
#[utoipa::path(
    post,
    path = "/tasks",
    tag = "tasks",
    request_body = TaskRequest,
    responses(
        (status = 202, description = "Task accepted", body = EnqueueResponse),
        (status = 400, description = "Invalid request or unknown task", body = ErrorResponse),
        (status = 503, description = "Broker unavailable", body = ErrorResponse)
    )
)]
async fn enqueue_task(
    State(state): State<MonitorState>,
    Json(request): Json<TaskRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    let id = state.producer.send(request).await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { id })))
}

#[utoipa::path(
    get,
    path = "/tasks/{id}",
    tag = "tasks",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task state and outcome", body = TaskStatusResponse)
    )
)]
async fn get_task(State(state): State<MonitorState>, Path(id): Path<Uuid>) -> Result<Json<TaskStatusResponse>> {
    let lookup = state.results.get(id).await?;
    Ok(Json(TaskStatusResponse::from_lookup(id, &lookup)))
}

// ============================================================================
// Monitoring
// ============================================================================

/// Depth of every known queue. Does not consume messages.
#[utoipa::path(
    get,
    path = "/monitoring/queues",
    tag = "monitoring",
    responses(
        (status = 200, description = "Per-queue depth", body = Vec<QueueDepth>)
    )
)]
async fn queue_depths(State(state): State<MonitorState>) -> Result<Json<Vec<QueueDepth>>> {
    let mut names: BTreeSet<String> = state.settings.known_queues.iter().cloned().collect();
    names.extend(state.broker.queues().await?);

    let mut depths = Vec::with_capacity(names.len());
    for queue in &names {
        depths.push(state.broker.depth(queue).await?);
    }
    Ok(Json(depths))
}

#[utoipa::path(
    get,
    path = "/monitoring/queues/{queue}/dead-letters",
    tag = "monitoring",
    params(("queue" = String, Path, description = "Queue name"), DeadLetterQuery),
    responses(
        (status = 200, description = "Most recent dead letters first", body = Vec<DeadLetter>)
    )
)]
async fn list_dead_letters(
    State(state): State<MonitorState>,
    Path(queue): Path<String>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .clamp(1, MAX_DEAD_LETTER_LIMIT);
    Ok(Json(state.broker.dead_letters(&queue, limit).await?))
}

#[utoipa::path(
    delete,
    path = "/monitoring/queues/{queue}/dead-letters",
    tag = "admin",
    params(("queue" = String, Path, description = "Queue name")),
    responses(
        (status = 200, description = "Dead letters removed", body = PurgeResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorResponse),
        (status = 403, description = "Not an administrator", body = ErrorResponse)
    ),
    security(("basic_auth" = []))
)]
async fn purge_dead_letters(
    AdminUser(admin): AdminUser,
    State(state): State<MonitorState>,
    Path(queue): Path<String>,
) -> Result<Json<PurgeResponse>> {
    let purged = state.broker.purge_dead_letters(&queue).await?;
    info!(admin = %admin, queue = %queue, purged, "Dead letters purged");
    Ok(Json(PurgeResponse { queue, purged }))
}

#[utoipa::path(
    get,
    path = "/monitoring/workers",
    tag = "monitoring",
    responses(
        (status = 200, description = "Registered workers with heartbeat age", body = Vec<WorkerStatus>)
    )
)]
async fn list_workers(State(state): State<MonitorState>) -> Result<Json<Vec<WorkerStatus>>> {
    let now = Utc::now();
    let stale_after = state.settings.stale_after;
    let workers = state
        .workers
        .list()
        .await?
        .into_iter()
        .map(|record| WorkerStatus::new(record, now, stale_after))
        .collect();
    Ok(Json(workers))
}

#[utoipa::path(
    get,
    path = "/monitoring/tasks/histogram",
    tag = "monitoring",
    params(HistogramQuery),
    responses(
        (status = 200, description = "Task records per state", body = HistogramResponse),
        (status = 400, description = "Window out of range", body = ErrorResponse)
    )
)]
async fn task_histogram(
    State(state): State<MonitorState>,
    Query(query): Query<HistogramQuery>,
) -> Result<Json<HistogramResponse>> {
    let window = query
        .window_secs
        .map(Duration::from_secs)
        .unwrap_or(state.settings.histogram_window);
    if window.is_zero() {
        return Err(MonitorError::Validation("window_secs must be positive".to_string()));
    }

    let since = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| Utc::now().checked_sub_signed(w))
        .ok_or_else(|| MonitorError::Validation("window_secs is too large".to_string()))?;

    let histogram = state.results.state_histogram(since).await?;
    let counts = TaskState::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), histogram.get(s).copied().unwrap_or(0)))
        .collect();

    Ok(Json(HistogramResponse {
        window_secs: window.as_secs(),
        since,
        counts,
    }))
}

/// Flag a task that has not started yet. The worker writes REVOKED when it sees the flag.
#[utoipa::path(
    post,
    path = "/monitoring/tasks/{id}/revoke",
    tag = "admin",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 202, description = "Revoke flag set", body = RevokeResponse),
        (status = 401, description = "Missing or invalid credentials", body = ErrorResponse),
        (status = 403, description = "Not an administrator", body = ErrorResponse),
        (status = 404, description = "Unknown or expired task", body = ErrorResponse),
        (status = 409, description = "Task already started or finished", body = ErrorResponse)
    ),
    security(("basic_auth" = []))
)]
async fn revoke_task(
    AdminUser(admin): AdminUser,
    State(state): State<MonitorState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RevokeResponse>)> {
    match state.results.request_revoke(id).await? {
        RevokeOutcome::Flagged => {
            info!(admin = %admin, task_id = %id, "Revoke requested");
            let lookup = state.results.get(id).await?;
            Ok((
                StatusCode::ACCEPTED,
                Json(RevokeResponse {
                    id,
                    state: lookup.state(),
                    revoke_requested: true,
                }),
            ))
        }
        RevokeOutcome::AlreadyStarted => Err(MonitorError::Conflict(format!(
            "task {id} has already started"
        ))),
        RevokeOutcome::AlreadyTerminal(terminal) => Err(MonitorError::Conflict(format!(
            "task {id} already finished with {terminal}"
        ))),
        RevokeOutcome::NotFound => Err(MonitorError::NotFound(format!("task {id}"))),
    }
}
