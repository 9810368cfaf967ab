//! Request forwarding.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use bl_common::CredentialStore;
use bl_config::ForwardedForPolicy;
use reqwest::Client;
use tracing::{debug, warn};

use crate::auth::authorize;
use crate::routes::{normalize_path, RouteEntry, RouteTable};
use crate::{GatewayError, Result};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// Connection-scoped headers that never cross the proxy.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub connect_timeout: Duration,
    /// Whole-exchange limit for one upstream request
    pub upstream_timeout: Duration,
    pub max_body_bytes: usize,
    /// Scheme clients used to reach the gateway, sent as `X-Forwarded-Proto`
    pub forwarded_proto: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            upstream_timeout: Duration::from_secs(60),
            max_body_bytes: 10 * 1024 * 1024,
            forwarded_proto: "https".to_string(),
        }
    }
}

/// State of one listener: its own route table plus the shared credential store.
#[derive(Clone)]
pub struct GatewayState {
    routes: Arc<RouteTable>,
    credentials: Arc<CredentialStore>,
    client: Client,
    settings: Arc<ProxySettings>,
    /// Listener name used in logs and metrics
    listener: &'static str,
}

impl GatewayState {
    pub fn new(
        listener: &'static str,
        routes: RouteTable,
        credentials: Arc<CredentialStore>,
        settings: ProxySettings,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.upstream_timeout)
            .pool_max_idle_per_host(32)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            routes: Arc::new(routes),
            credentials,
            client,
            settings: Arc::new(settings),
            listener,
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }
}

pub async fn proxy_handler(
    State(state): State<GatewayState>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match forward(&state, client, request).await {
        Ok(response) => response,
        Err(e) => {
            let outcome = match &e {
                GatewayError::NoRoute | GatewayError::BadPath => "no_route",
                GatewayError::Unauthorized | GatewayError::Forbidden(_) => "denied",
                _ => "error",
            };
            metrics::counter!("backlot.gateway.requests_total", "listener" => state.listener, "outcome" => outcome)
                .increment(1);
            e.into_response()
        }
    }
}

async fn forward(state: &GatewayState, client: SocketAddr, request: Request) -> Result<Response> {
    let (parts, body) = request.into_parts();
    let path = normalize_path(parts.uri.path()).ok_or_else(|| {
        debug!(listener = state.listener, path = %parts.uri.path(), "Rejected path");
        GatewayError::BadPath
    })?;
    let path = path.as_str();

    let route = state.routes.resolve(path).ok_or_else(|| {
        debug!(listener = state.listener, path = %path, "No route");
        GatewayError::NoRoute
    })?;

    authorize(route, &parts.headers, &state.credentials).await?;

    let max = state.settings.max_body_bytes;
    let body = to_bytes(body, max).await.map_err(|_| GatewayError::BodyTooLarge(max))?;

    let target = route.target_url(path, parts.uri.query());
    let headers = upstream_headers(&parts.headers, route, client.ip(), &state.settings.forwarded_proto);

    let started = Instant::now();
    let upstream = state
        .client
        .request(parts.method.clone(), target)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| upstream_error(route, e))?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);
    let bytes = upstream.bytes().await.map_err(|e| upstream_error(route, e))?;

    metrics::counter!("backlot.gateway.requests_total", "listener" => state.listener, "outcome" => "forwarded")
        .increment(1);
    metrics::histogram!("backlot.gateway.upstream_duration_seconds", "listener" => state.listener)
        .record(started.elapsed().as_secs_f64());
    debug!(
        listener = state.listener,
        method = %parts.method,
        path = %path,
        upstream = %route.upstream,
        status = status.as_u16(),
        "Forwarded"
    );

    let mut response = Body::from(bytes).into_response();
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

fn upstream_error(route: &RouteEntry, e: reqwest::Error) -> GatewayError {
    let upstream = route.upstream.to_string();
    if e.is_timeout() {
        warn!(upstream = %upstream, "Upstream timed out");
        GatewayError::UpstreamTimeout { upstream }
    } else {
        warn!(upstream = %upstream, error = %e, "Upstream request failed");
        GatewayError::Upstream {
            upstream,
            reason: e.to_string(),
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Incoming headers as sent upstream, with the forwarding headers set.
pub fn upstream_headers(incoming: &HeaderMap, route: &RouteEntry, client_ip: IpAddr, proto: &str) -> HeaderMap {
    let mut headers = incoming.clone();
    strip_hop_by_hop(&mut headers);
    // Recomputed by the client for the upstream request
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let client = client_ip.to_string();
    let forwarded_for = match route.forwarded_for {
        ForwardedForPolicy::Replace => client.clone(),
        ForwardedForPolicy::Append => {
            let chain: Vec<&str> = incoming
                .get_all(&X_FORWARDED_FOR)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .collect();
            if chain.is_empty() {
                client.clone()
            } else {
                format!("{}, {client}", chain.join(", "))
            }
        }
    };

    set(&mut headers, X_FORWARDED_FOR, &forwarded_for);
    set(&mut headers, X_REAL_IP, &client);
    set(&mut headers, X_FORWARDED_PROTO, proto);
    if let Some(host) = incoming.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    headers
}

fn set(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(e) => warn!(header = %name, error = %e, "Dropping unencodable forwarding header"),
    }
}
