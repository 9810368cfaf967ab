use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod credentials;
pub mod logging;

pub use credentials::{hash_password, BasicCredentials, CredentialError, CredentialStore};

/// Queue used when a request does not name one.
pub const DEFAULT_QUEUE: &str = "default";

// ============================================================================
// Task Messages
// ============================================================================

/// Retry behaviour attached to every task message.
///
/// The delay before retry `n` (zero based) is `base_delay_ms * backoff_multiplier^n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, retries: u32) -> Duration {
        let exponent = i32::try_from(retries).unwrap_or(i32::MAX);
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        // float to int casts saturate
        Duration::from_millis(millis as u64)
    }

    pub fn is_exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }
}

/// A unit of deferred work as stored in the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaskMessage {
    pub id: Uuid,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub kwargs: Map<String, Value>,
    pub queue: String,
    /// Not-before time. `None` means immediately runnable.
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub retries: u32,
    pub created_at: DateTime<Utc>,
}

impl TaskMessage {
    pub fn new(task_name: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            queue: queue.into(),
            eta: None,
            retry_policy: RetryPolicy::default(),
            retries: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_eta(mut self, eta: DateTime<Utc>) -> Self {
        self.eta = Some(eta);
        self
    }

    /// Copy of this message for the next attempt.
    pub fn next_attempt(&self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self.clone()
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("task_name must not be empty")]
    EmptyTaskName,

    #[error("eta and countdown are mutually exclusive")]
    EtaAndCountdown,

    #[error("countdown must be a finite, non-negative number of seconds")]
    InvalidCountdown,

    #[error("queue name must not be empty")]
    EmptyQueue,
}

/// Producer-side request to enqueue a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct TaskRequest {
    /// Caller supplied id. Re-sending the same id does not enqueue twice.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub eta: Option<DateTime<Utc>>,
    /// Delay in seconds, converted to an absolute eta at enqueue time.
    #[serde(default)]
    pub countdown: Option<f64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl TaskRequest {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            ..Default::default()
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_countdown(mut self, seconds: f64) -> Self {
        self.countdown = Some(seconds);
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Map<String, Value>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Validate and resolve into a storable message.
    pub fn into_message(
        self,
        default_queue: &str,
        default_policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<TaskMessage, ValidationError> {
        if self.task_name.trim().is_empty() {
            return Err(ValidationError::EmptyTaskName);
        }

        let eta = match (self.eta, self.countdown) {
            (Some(_), Some(_)) => return Err(ValidationError::EtaAndCountdown),
            (Some(eta), None) => Some(eta),
            (None, Some(countdown)) => {
                if !countdown.is_finite() || countdown < 0.0 {
                    return Err(ValidationError::InvalidCountdown);
                }
                let millis = (countdown * 1000.0).round() as i64;
                Some(now + chrono::Duration::milliseconds(millis))
            }
            (None, None) => None,
        };

        let queue = self.queue.unwrap_or_else(|| default_queue.to_string());
        if queue.trim().is_empty() {
            return Err(ValidationError::EmptyQueue);
        }

        Ok(TaskMessage {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            task_name: self.task_name,
            args: self.args,
            kwargs: self.kwargs,
            queue,
            eta,
            retry_policy: self.retry_policy.unwrap_or_else(|| default_policy.clone()),
            retries: 0,
            created_at: now,
        })
    }
}

/// A message handed to one consumer for the duration of its visibility period.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: TaskMessage,
    /// Opaque claim token. Only the current holder's handle can ack or nack.
    pub receipt_handle: String,
    pub queue: String,
    /// How many times the broker has handed this message out, including this one.
    pub receive_count: u32,
}

// ============================================================================
// Task State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
    DeadLetter,
    Revoked,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Pending,
        TaskState::Started,
        TaskState::Success,
        TaskState::Failure,
        TaskState::Retry,
        TaskState::DeadLetter,
        TaskState::Revoked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Started => "STARTED",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
            TaskState::Retry => "RETRY",
            TaskState::DeadLetter => "DEAD_LETTER",
            TaskState::Revoked => "REVOKED",
        }
    }

    /// SUCCESS, DEAD_LETTER and REVOKED never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::DeadLetter | TaskState::Revoked)
    }

    /// States in which a revoke request can still take effect.
    pub fn is_revocable(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Retry)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown task state: {}", s))
    }
}

/// Lifecycle record of a task, owned by the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaskRecord {
    pub id: Uuid,
    pub task_name: String,
    pub queue: String,
    pub state: TaskState,
    pub retries: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub revoke_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn pending(message: &TaskMessage, now: DateTime<Utc>) -> Self {
        Self {
            id: message.id,
            task_name: message.task_name.clone(),
            queue: message.queue.clone(),
            state: TaskState::Pending,
            retries: message.retries,
            result: None,
            error: None,
            worker_id: None,
            revoke_requested: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Terminal outcome written by a worker. Writing replaces every outcome field.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub retries: u32,
    pub worker_id: Option<String>,
}

impl TaskOutcome {
    pub fn success(result: Value, retries: u32) -> Self {
        Self {
            state: TaskState::Success,
            result: Some(result),
            error: None,
            retries,
            worker_id: None,
        }
    }

    pub fn dead_letter(error: impl Into<String>, retries: u32) -> Self {
        Self {
            state: TaskState::DeadLetter,
            result: None,
            error: Some(error.into()),
            retries,
            worker_id: None,
        }
    }

    pub fn revoked(retries: u32) -> Self {
        Self {
            state: TaskState::Revoked,
            result: None,
            error: None,
            retries,
            worker_id: None,
        }
    }

    pub fn by_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }
}

// ============================================================================
// Queues and Workers
// ============================================================================

/// Non-consuming snapshot of one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueueDepth {
    pub queue: String,
    /// Visible now (including expired claims awaiting redelivery)
    pub pending: u64,
    /// Waiting on an eta or retry delay
    pub delayed: u64,
    /// Claimed by a worker and still inside the visibility period
    pub in_flight: u64,
    pub dead_letter: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeadLetter {
    pub message: TaskMessage,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Heartbeat record published by each worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkerRecord {
    pub id: String,
    pub hostname: String,
    pub pid: u32,
    pub concurrency: u32,
    pub queues: Vec<String>,
    pub task_names: Vec<String>,
    pub active_tasks: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.heartbeat_age(now) > threshold
    }
}

/// Count of task records per state.
pub type StateHistogram = HashMap<TaskState, u64>;
