use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bl_broker::BrokerError;
use bl_results::ResultStoreError;
use bl_worker::WorkerError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Authentication required")]
    Unauthorized,

    #[error("User '{0}' is not an administrator")]
    Forbidden(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Result store error: {0}")]
    Results(#[from] ResultStoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<WorkerError> for MonitorError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::Validation(e) => MonitorError::Validation(e.to_string()),
            WorkerError::UnknownTask(name) => MonitorError::Validation(format!("unknown task '{name}'")),
            e if e.is_unavailable() => MonitorError::Unavailable(e.to_string()),
            WorkerError::Broker(e) => MonitorError::Broker(e),
            WorkerError::Results(e) => MonitorError::Results(e),
            other => MonitorError::Internal(other.to_string()),
        }
    }
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl MonitorError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            MonitorError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            MonitorError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            MonitorError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            MonitorError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            MonitorError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            MonitorError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            MonitorError::Broker(e) if e.is_unavailable() => (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE"),
            MonitorError::Results(ResultStoreError::Unavailable(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"backlot\""),
            );
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
