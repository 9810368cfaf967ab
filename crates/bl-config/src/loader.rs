//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "backlot.toml",
    "config.toml",
    "./config/backlot.toml",
    "/etc/backlot/backlot.toml",
];

/// Configuration loader
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found), apply environment overrides, then validate.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.find_config_file()? {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => {
                warn!("No configuration file found, using defaults");
                AppConfig::default()
            }
        };

        apply_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        // An explicit path that does not exist is an operator mistake, not a fallback case
        if let Some(path) = &self.config_path {
            if !path.exists() {
                return Err(ConfigError::ValidationError(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Ok(Some(path.clone()));
        }

        if let Ok(path) = env::var("BACKLOT_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!(?path, "BACKLOT_CONFIG points at a missing file");
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }
}

fn parse_into<T: FromStr>(target: &mut T, key: &str, value: Option<String>) {
    if let Some(raw) = value {
        match raw.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(key, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Apply `BACKLOT_*` overrides read through `lookup`.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    // Broker
    if let Some(val) = lookup("BACKLOT_BROKER_BACKEND") {
        config.broker.backend = val;
    }
    if let Some(val) = lookup("BACKLOT_BROKER_URL") {
        config.broker.database_url = val;
    }
    parse_into(
        &mut config.broker.visibility_timeout_secs,
        "BACKLOT_VISIBILITY_TIMEOUT_SECS",
        lookup("BACKLOT_VISIBILITY_TIMEOUT_SECS"),
    );

    // Results
    if let Some(val) = lookup("BACKLOT_RESULTS_URL") {
        config.results.database_url = Some(val);
    }
    parse_into(
        &mut config.results.result_ttl_secs,
        "BACKLOT_RESULT_TTL_SECS",
        lookup("BACKLOT_RESULT_TTL_SECS"),
    );

    // Worker
    if let Some(val) = lookup("BACKLOT_WORKER_ID") {
        config.worker.worker_id = val;
    }
    parse_into(
        &mut config.worker.concurrency,
        "BACKLOT_WORKER_CONCURRENCY",
        lookup("BACKLOT_WORKER_CONCURRENCY"),
    );
    if let Some(val) = lookup("BACKLOT_WORKER_QUEUES") {
        config.worker.queues = split_list(&val);
    }
    parse_into(
        &mut config.worker.task_timeout_secs,
        "BACKLOT_TASK_TIMEOUT_SECS",
        lookup("BACKLOT_TASK_TIMEOUT_SECS"),
    );

    // Scheduler
    parse_into(
        &mut config.scheduler.enabled,
        "BACKLOT_SCHEDULER_ENABLED",
        lookup("BACKLOT_SCHEDULER_ENABLED"),
    );
    parse_into(
        &mut config.scheduler.tick_interval_ms,
        "BACKLOT_SCHEDULER_TICK_MS",
        lookup("BACKLOT_SCHEDULER_TICK_MS"),
    );

    // Leader
    if let Some(val) = lookup("BACKLOT_LEADER_BACKEND") {
        config.leader.backend = val;
    }
    if let Some(val) = lookup("BACKLOT_REDIS_URL") {
        config.leader.redis_url = val;
    }
    if let Some(val) = lookup("BACKLOT_LEADER_INSTANCE_ID") {
        config.leader.instance_id = val;
    }
    parse_into(
        &mut config.leader.ttl_secs,
        "BACKLOT_LEADER_TTL_SECS",
        lookup("BACKLOT_LEADER_TTL_SECS"),
    );

    // Monitor
    if let Some(val) = lookup("BACKLOT_MONITOR_HOST") {
        config.monitor.host = val;
    }
    parse_into(
        &mut config.monitor.port,
        "BACKLOT_MONITOR_PORT",
        lookup("BACKLOT_MONITOR_PORT"),
    );

    // Gateway
    if let Some(val) = lookup("BACKLOT_SERVER_NAME") {
        config.gateway.server_name = val;
    }
    if let Some(val) = lookup("BACKLOT_TLS_CERT_PATH") {
        config.gateway.tls_cert_path = val;
    }
    if let Some(val) = lookup("BACKLOT_TLS_KEY_PATH") {
        config.gateway.tls_key_path = val;
    }
    if let Some(val) = lookup("BACKLOT_GATEWAY_HTTPS_ADDR") {
        config.gateway.https_addr = val;
    }
    if let Some(val) = lookup("BACKLOT_GATEWAY_HTTP_ADDR") {
        config.gateway.http_addr = val;
    }
}
