//! Backlot Gateway
//!
//! `bl-gateway` serves the configured listeners until SIGINT/SIGTERM.
//! `bl-gateway hash-password` prints an Argon2 hash for the `[credentials]` table.

use std::io::BufRead;
use std::net::SocketAddr;

use anyhow::Result;
use bl_common::{hash_password, CredentialStore};
use bl_config::ConfigLoader;
use bl_gateway::Gateway;
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bl-gateway")]
#[command(about = "Backlot TLS-terminating gateway")]
struct Args {
    /// Config file (searched in the usual locations when omitted)
    #[arg(long, env = "BACKLOT_CONFIG", global = true)]
    config: Option<String>,

    /// Prometheus scrape listener, kept off the public listeners
    #[arg(long, env = "BACKLOT_GATEWAY_METRICS_ADDR", default_value = "127.0.0.1:9102")]
    metrics_addr: SocketAddr,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the listeners (default)
    Serve,
    /// Hash a password for the `[credentials]` table; reads stdin when omitted
    HashPassword { password: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::HashPassword { password }) = &args.command {
        let password = match password {
            Some(password) => password.clone(),
            None => read_password()?,
        };
        println!("{}", hash_password(&password)?);
        return Ok(());
    }

    bl_common::logging::init_logging("bl-gateway");
    info!("Starting Backlot gateway");

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    let config = match &args.config {
        Some(path) => ConfigLoader::with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };
    config.gateway.validate_listeners()?;

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {e}"))?;
    info!(addr = %args.metrics_addr, "Metrics listener started");

    let credentials = CredentialStore::from_hashes(config.credentials.clone())?;
    if credentials.is_empty() && config.gateway.routes.iter().any(|r| r.auth_required) {
        warn!("Protected routes are configured but no credentials are defined; every request to them will be rejected");
    }

    let gateway = Gateway::new(config.gateway, credentials)?;
    gateway.run(shutdown_signal()).await?;

    info!("Gateway stopped");
    Ok(())
}

fn read_password() -> Result<String> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        anyhow::bail!("empty password");
    }
    Ok(password)
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
