//! Listeners: primary TLS edge, plaintext redirect, isolated cache UI.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use axum_server::{tls_rustls::RustlsConfig, Handle};
use bl_common::CredentialStore;
use bl_config::GatewayConfig;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::proxy::{proxy_handler, GatewayState, ProxySettings};
use crate::routes::RouteTable;
use crate::{GatewayError, Result};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Every path goes through the route table; unmatched paths get 404.
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `https://{server_name}[:port]` plus the original path and query.
pub fn redirect_location(server_name: &str, https_port: Option<u16>, uri: &Uri) -> String {
    let authority = match https_port {
        None | Some(443) => server_name.to_string(),
        Some(port) => format!("{server_name}:{port}"),
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("https://{authority}{path_and_query}")
}

/// Plaintext listener: answers everything with 308 to the secure scheme.
pub fn redirect_router(server_name: impl Into<String>, https_port: Option<u16>) -> Router {
    let server_name: Arc<str> = Arc::from(server_name.into());
    Router::new().fallback(move |uri: Uri| {
        let server_name = server_name.clone();
        async move { redirect(&server_name, https_port, &uri) }
    })
}

fn redirect(server_name: &str, https_port: Option<u16>, uri: &Uri) -> Response {
    let location = redirect_location(server_name, https_port, uri);
    (StatusCode::PERMANENT_REDIRECT, [(header::LOCATION, location)]).into_response()
}

fn parse_addr(name: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| GatewayError::Config(format!("{name} '{value}': {e}")))
}

/// The configured set of listeners.
pub struct Gateway {
    config: GatewayConfig,
    primary: GatewayState,
    cache_ui: Option<GatewayState>,
}

impl Gateway {
    /// Build route tables and HTTP clients. Fails on any invalid route.
    pub fn new(config: GatewayConfig, credentials: CredentialStore) -> Result<Self> {
        let credentials = Arc::new(credentials);
        let settings = ProxySettings {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            upstream_timeout: Duration::from_millis(config.upstream_timeout_ms),
            max_body_bytes: config.max_body_bytes,
            forwarded_proto: "https".to_string(),
        };

        let primary = GatewayState::new(
            "primary",
            RouteTable::from_config(&config.routes)?,
            credentials.clone(),
            settings.clone(),
        )?;
        let cache_ui = if config.cache_ui.enabled {
            Some(GatewayState::new(
                "cache_ui",
                RouteTable::from_config(&config.cache_ui.routes)?,
                credentials,
                settings,
            )?)
        } else {
            None
        };

        Ok(Self {
            config,
            primary,
            cache_ui,
        })
    }

    /// Serve until `shutdown` resolves, then drain connections.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tls = RustlsConfig::from_pem_file(&self.config.tls_cert_path, &self.config.tls_key_path)
            .await
            .map_err(|e| GatewayError::Tls(format!("{}: {e}", self.config.tls_cert_path)))?;

        let https_addr = parse_addr("gateway.https_addr", &self.config.https_addr)?;
        let http_addr = parse_addr("gateway.http_addr", &self.config.http_addr)?;
        let https_port = self.config.public_https_port.or(Some(https_addr.port()));

        let mut handles = Vec::new();
        let mut servers = JoinSet::new();

        let handle = Handle::new();
        handles.push(handle.clone());
        let app = gateway_router(self.primary.clone());
        let primary_tls = tls.clone();
        servers.spawn(async move {
            axum_server::bind_rustls(https_addr, primary_tls)
                .handle(handle)
                .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                .await
        });
        info!(
            addr = %https_addr,
            server_name = %self.config.server_name,
            routes = self.primary.routes().len(),
            "Gateway TLS listener started"
        );

        let handle = Handle::new();
        handles.push(handle.clone());
        let redirect = redirect_router(self.config.server_name.clone(), https_port);
        servers.spawn(async move {
            axum_server::bind(http_addr)
                .handle(handle)
                .serve(redirect.into_make_service())
                .await
        });
        info!(addr = %http_addr, "Plaintext redirect listener started");

        if let Some(cache_ui) = self.cache_ui.clone() {
            let addr = parse_addr("gateway.cache_ui.https_addr", &self.config.cache_ui.https_addr)?;
            let handle = Handle::new();
            handles.push(handle.clone());
            let routes = cache_ui.routes().len();
            let app = gateway_router(cache_ui);
            let cache_tls = tls.clone();
            servers.spawn(async move {
                axum_server::bind_rustls(addr, cache_tls)
                    .handle(handle)
                    .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            });
            info!(addr = %addr, routes, "Cache UI listener started");
        }

        let shutdown_handles = handles.clone();
        tokio::spawn(async move {
            shutdown.await;
            info!("Gateway shutting down");
            for handle in &shutdown_handles {
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            }
        });

        let mut failure = None;
        while let Some(joined) = servers.join_next().await {
            let outcome = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => GatewayError::Io(e),
                Err(e) => GatewayError::Config(format!("listener task failed: {e}")),
            };
            error!(error = %outcome, "Gateway listener stopped");
            // One listener down takes the others with it
            for handle in &handles {
                handle.shutdown();
            }
            failure.get_or_insert(outcome);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_location() {
        let uri: Uri = "/docs/index.html?lang=en".parse().unwrap();
        assert_eq!(
            redirect_location("backlot.example.com", Some(443), &uri),
            "https://backlot.example.com/docs/index.html?lang=en"
        );
        assert_eq!(
            redirect_location("backlot.example.com", Some(8443), &uri),
            "https://backlot.example.com:8443/docs/index.html?lang=en"
        );
        let root: Uri = "/".parse().unwrap();
        assert_eq!(redirect_location("backlot.example.com", None, &root), "https://backlot.example.com/");
    }
}
