//! Backlot Gateway
//!
//! TLS-terminating reverse proxy in front of the API, the monitoring service
//! and the admin UIs.
//!
//! - Routes by longest matching path prefix, on segment boundaries, after
//!   resolving dot segments so auth and forwarding see the same path
//! - Unmatched paths get a fixed `404 not found`; there is no default upstream
//! - Protected routes require HTTP Basic credentials checked against Argon2 hashes
//! - Forwarded requests always carry `X-Forwarded-For`, `X-Real-IP`,
//!   `X-Forwarded-Proto` and `X-Forwarded-Host`
//! - Upstream failures and timeouts become `502 bad gateway`
//! - A plaintext listener redirects everything to HTTPS with `308`
//! - An optional second TLS listener serves the cache UI from its own route table

pub mod auth;
pub mod error;
pub mod proxy;
pub mod routes;
pub mod server;

pub use error::{GatewayError, Result};
pub use proxy::{proxy_handler, GatewayState, ProxySettings};
pub use routes::{normalize_path, RouteEntry, RouteTable};
pub use server::{gateway_router, redirect_location, redirect_router, Gateway};
