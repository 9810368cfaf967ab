use std::sync::Arc;

use axum::http::{header, HeaderMap};
use bl_common::{BasicCredentials, CredentialStore};
use tracing::{debug, warn};

use crate::routes::RouteEntry;
use crate::{GatewayError, Result};

/// Check Basic credentials for a protected route.
///
/// Returns the authenticated user, or `None` for routes that need no auth.
pub async fn authorize(
    route: &RouteEntry,
    headers: &HeaderMap,
    credentials: &Arc<CredentialStore>,
) -> Result<Option<String>> {
    if !route.auth_required {
        return Ok(None);
    }

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(BasicCredentials::parse)
        .ok_or(GatewayError::Unauthorized)?;

    let store = credentials.clone();
    let candidate = presented.clone();
    let valid = tokio::task::spawn_blocking(move || store.verify(&candidate))
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Credential check panicked");
            false
        });

    if !valid {
        warn!(username = %presented.username, prefix = %route.path_prefix, "Rejected credentials");
        return Err(GatewayError::Unauthorized);
    }
    if !route.allows(&presented.username) {
        warn!(username = %presented.username, prefix = %route.path_prefix, "User not allowed on route");
        return Err(GatewayError::Forbidden(presented.username));
    }

    debug!(username = %presented.username, prefix = %route.path_prefix, "Authenticated");
    Ok(Some(presented.username))
}
