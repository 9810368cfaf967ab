//! Admin Basic authentication for mutating endpoints.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use bl_common::BasicCredentials;
use tracing::{debug, warn};

use crate::{MonitorError, MonitorState};

/// An authenticated user listed in `admin_users`.
#[derive(Debug, Clone)]
pub struct AdminUser(pub String);

impl FromRequestParts<MonitorState> for AdminUser {
    type Rejection = MonitorError;

    async fn from_request_parts(parts: &mut Parts, state: &MonitorState) -> Result<Self, Self::Rejection> {
        let credentials = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(BasicCredentials::parse)
            .ok_or(MonitorError::Unauthorized)?;

        // Argon2 is CPU-bound
        let store = state.credentials.clone();
        let candidate = credentials.clone();
        let valid = tokio::task::spawn_blocking(move || store.verify(&candidate))
            .await
            .map_err(|e| MonitorError::Internal(format!("credential check failed: {e}")))?;

        if !valid {
            warn!(username = %credentials.username, "Rejected admin credentials");
            return Err(MonitorError::Unauthorized);
        }
        if !state.settings.admin_users.contains(&credentials.username) {
            return Err(MonitorError::Forbidden(credentials.username));
        }

        debug!(username = %credentials.username, "Admin authenticated");
        Ok(AdminUser(credentials.username))
    }
}
