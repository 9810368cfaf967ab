use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("not found")]
    NoRoute,

    #[error("malformed request path")]
    BadPath,

    #[error("unauthorized")]
    Unauthorized,

    #[error("user '{0}' may not access this route")]
    Forbidden(String),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("upstream {upstream} timed out")]
    UpstreamTimeout { upstream: String },

    #[error("upstream {upstream} failed: {reason}")]
    Upstream { upstream: String, reason: String },

    #[error("Invalid route '{prefix}': {reason}")]
    InvalidRoute { prefix: String, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Client-facing responses stay fixed and terse; details go to the log.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            GatewayError::NoRoute => (StatusCode::NOT_FOUND, "not found"),
            GatewayError::BadPath => (StatusCode::BAD_REQUEST, "bad request"),
            GatewayError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            GatewayError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            GatewayError::BodyTooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "payload too large"),
            GatewayError::UpstreamTimeout { .. } | GatewayError::Upstream { .. } => {
                (StatusCode::BAD_GATEWAY, "bad gateway")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };

        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"backlot\", charset=\"UTF-8\""),
            );
        }
        response
    }
}
