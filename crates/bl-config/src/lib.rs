//! Backlot Configuration System
//!
//! TOML configuration shared by the worker, scheduler, monitor and gateway
//! processes, with `BACKLOT_*` environment variable overrides.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use bl_common::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Built-in maintenance task that sweeps expired results.
pub const PURGE_EXPIRED_RESULTS_TASK: &str = "backlot.purge_expired_results";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub results: ResultsConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub leader: LeaderConfig,
    pub monitor: MonitorConfig,
    pub gateway: GatewayConfig,
    /// `username -> Argon2 PHC hash`
    pub credentials: HashMap<String, String>,
    pub integrations: Vec<IntegrationConfig>,
}

/// Broker/queue storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// `sqlite` or `memory`
    pub backend: String,
    pub database_url: String,
    pub max_connections: u32,
    pub visibility_timeout_secs: u64,
    /// Upper bound on how long a blocking dequeue sleeps between checks.
    pub poll_interval_ms: u64,
    pub default_queue: String,
    pub default_retry: RetryPolicy,
    /// Producer reconnect attempts while the broker is unavailable
    pub enqueue_max_attempts: u32,
    pub enqueue_backoff_ms: u64,
    pub enqueue_backoff_max_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            database_url: "sqlite://data/backlot.db".to_string(),
            max_connections: 5,
            visibility_timeout_secs: 300,
            poll_interval_ms: 500,
            default_queue: bl_common::DEFAULT_QUEUE.to_string(),
            default_retry: RetryPolicy::default(),
            enqueue_max_attempts: 5,
            enqueue_backoff_ms: 200,
            enqueue_backoff_max_ms: 5_000,
        }
    }
}

impl BrokerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Result store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Defaults to the broker database when unset
    pub database_url: Option<String>,
    pub result_ttl_secs: u64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            result_ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Generated from hostname and pid when empty
    pub worker_id: String,
    pub concurrency: u32,
    /// Priority order, highest first
    pub queues: Vec<String>,
    /// Consecutive pulls from the top queue before lower queues get a turn
    pub starvation_limit: u32,
    pub task_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub stale_after_secs: u64,
    pub shutdown_grace_secs: u64,
    pub fetch_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            concurrency: 4,
            queues: vec![bl_common::DEFAULT_QUEUE.to_string()],
            starvation_limit: 8,
            task_timeout_secs: 120,
            heartbeat_interval_secs: 10,
            stale_after_secs: 60,
            shutdown_grace_secs: 30,
            fetch_backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    pub entries: Vec<ScheduleEntryConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1_000,
            entries: Vec::new(),
        }
    }
}

/// One periodic task. Exactly one of `every_secs` or `cron` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleEntryConfig {
    pub name: String,
    pub task: String,
    pub every_secs: Option<u64>,
    pub cron: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub queue: Option<String>,
    pub jitter_secs: u64,
    pub enabled: bool,
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for ScheduleEntryConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            task: String::new(),
            every_secs: None,
            cron: None,
            args: Vec::new(),
            kwargs: Map::new(),
            queue: None,
            jitter_secs: 0,
            enabled: true,
            retry_policy: None,
        }
    }
}

/// Leased lock used for scheduler leader election
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// `redis` or `memory` (single process only)
    pub backend: String,
    pub redis_url: String,
    pub lock_key: String,
    pub instance_id: String,
    pub ttl_secs: u64,
    pub refresh_interval_ms: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            backend: "redis".to_string(),
            redis_url: "redis://localhost:6379/0".to_string(),
            lock_key: "backlot:scheduler:leader".to_string(),
            instance_id: String::new(),
            ttl_secs: 30,
            refresh_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub host: String,
    pub port: u16,
    /// Users (from `[credentials]`) allowed to revoke and purge
    pub admin_users: Vec<String>,
    pub histogram_window_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            admin_users: Vec::new(),
            histogram_window_secs: 3_600,
        }
    }
}

/// How the gateway treats an incoming `X-Forwarded-For` chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardedForPolicy {
    #[default]
    Append,
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub upstream: String,
    pub auth_required: bool,
    /// Empty means any authenticated user
    pub allowed_users: Vec<String>,
    pub strip_prefix: bool,
    pub forwarded_for: ForwardedForPolicy,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/".to_string(),
            upstream: String::new(),
            auth_required: false,
            allowed_users: Vec::new(),
            strip_prefix: false,
            forwarded_for: ForwardedForPolicy::Append,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheUiConfig {
    pub enabled: bool,
    pub https_addr: String,
    pub routes: Vec<RouteConfig>,
}

impl Default for CacheUiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            https_addr: "0.0.0.0:8444".to_string(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server_name: String,
    pub https_addr: String,
    pub http_addr: String,
    /// Port advertised in redirects when it is not 443
    pub public_https_port: Option<u16>,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    pub connect_timeout_ms: u64,
    pub upstream_timeout_ms: u64,
    pub max_body_bytes: usize,
    pub routes: Vec<RouteConfig>,
    pub cache_ui: CacheUiConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            https_addr: "0.0.0.0:8443".to_string(),
            http_addr: "0.0.0.0:8080".to_string(),
            public_https_port: None,
            tls_cert_path: String::new(),
            tls_key_path: String::new(),
            connect_timeout_ms: 5_000,
            upstream_timeout_ms: 60_000,
            max_body_bytes: 10 * 1024 * 1024,
            routes: Vec::new(),
            cache_ui: CacheUiConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Checks that only matter to the gateway process.
    pub fn validate_listeners(&self) -> Result<(), ConfigError> {
        if self.server_name.trim().is_empty() {
            return Err(invalid("gateway.server_name must be set"));
        }
        if self.tls_cert_path.is_empty() || self.tls_key_path.is_empty() {
            return Err(invalid("gateway.tls_cert_path and gateway.tls_key_path are required"));
        }
        if self.routes.is_empty() {
            return Err(invalid("gateway.routes must not be empty"));
        }
        if self.cache_ui.enabled && self.cache_ui.routes.is_empty() {
            return Err(invalid("gateway.cache_ui.routes must not be empty when enabled"));
        }
        Ok(())
    }
}

/// Maps a task name to an HTTP integration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    pub task: String,
    pub endpoint: String,
    pub timeout_secs: u64,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            task: String::new(),
            endpoint: String::new(),
            timeout_secs: 30,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    pub fn results_database_url(&self) -> &str {
        self.results
            .database_url
            .as_deref()
            .unwrap_or(&self.broker.database_url)
    }

    /// Every task name some worker in this deployment can execute.
    pub fn task_catalog(&self) -> BTreeSet<String> {
        let mut catalog: BTreeSet<String> =
            self.integrations.iter().map(|i| i.task.clone()).collect();
        catalog.insert(PURGE_EXPIRED_RESULTS_TASK.to_string());
        catalog
    }

    /// Cross-section consistency checks shared by every process.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.broker.backend.as_str(), "sqlite" | "memory") {
            return Err(invalid(format!("unknown broker.backend '{}'", self.broker.backend)));
        }
        if self.broker.visibility_timeout_secs == 0 {
            return Err(invalid("broker.visibility_timeout_secs must be positive"));
        }

        if self.worker.queues.is_empty() || self.worker.queues.iter().any(|q| q.trim().is_empty()) {
            return Err(invalid("worker.queues must list at least one non-empty queue name"));
        }
        if self.worker.concurrency == 0 {
            return Err(invalid("worker.concurrency must be positive"));
        }
        if self.worker.task_timeout_secs >= self.broker.visibility_timeout_secs {
            return Err(invalid(format!(
                "worker.task_timeout_secs ({}) must be shorter than broker.visibility_timeout_secs ({})",
                self.worker.task_timeout_secs, self.broker.visibility_timeout_secs
            )));
        }
        if self.worker.stale_after_secs <= self.worker.heartbeat_interval_secs {
            return Err(invalid("worker.stale_after_secs must exceed worker.heartbeat_interval_secs"));
        }

        self.validate_schedule()?;
        self.validate_leader()?;
        self.validate_routes(&self.gateway.routes, "gateway.routes")?;
        self.validate_routes(&self.gateway.cache_ui.routes, "gateway.cache_ui.routes")?;

        for user in &self.monitor.admin_users {
            if !self.credentials.contains_key(user) {
                return Err(invalid(format!("monitor.admin_users: '{}' has no credentials", user)));
            }
        }

        let mut seen = HashSet::new();
        for integration in &self.integrations {
            if integration.task.is_empty() || integration.endpoint.is_empty() {
                return Err(invalid("integrations need both task and endpoint"));
            }
            if !seen.insert(integration.task.as_str()) {
                return Err(invalid(format!("duplicate integration task '{}'", integration.task)));
            }
        }

        Ok(())
    }

    fn validate_schedule(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(invalid("scheduler.tick_interval_ms must be positive"));
        }
        let mut names = HashSet::new();
        for entry in &self.scheduler.entries {
            if entry.name.is_empty() || entry.task.is_empty() {
                return Err(invalid("scheduler entries need a name and a task"));
            }
            if !names.insert(entry.name.as_str()) {
                return Err(invalid(format!("duplicate schedule entry '{}'", entry.name)));
            }
            match (entry.every_secs, &entry.cron) {
                (Some(0), None) => {
                    return Err(invalid(format!("schedule '{}': every_secs must be positive", entry.name)))
                }
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(invalid(format!(
                        "schedule '{}': set exactly one of every_secs or cron",
                        entry.name
                    )))
                }
            }
        }
        Ok(())
    }

    fn validate_leader(&self) -> Result<(), ConfigError> {
        if !matches!(self.leader.backend.as_str(), "redis" | "memory") {
            return Err(invalid(format!("unknown leader.backend '{}'", self.leader.backend)));
        }
        if self.leader.refresh_interval_ms > self.scheduler.tick_interval_ms {
            return Err(invalid(
                "leader.refresh_interval_ms must not exceed scheduler.tick_interval_ms",
            ));
        }
        if self.leader.refresh_interval_ms >= self.leader.ttl_secs * 1000 {
            return Err(invalid("leader.refresh_interval_ms must be shorter than leader.ttl_secs"));
        }
        Ok(())
    }

    fn validate_routes(&self, routes: &[RouteConfig], section: &str) -> Result<(), ConfigError> {
        let mut prefixes = HashSet::new();
        for route in routes {
            if !route.path_prefix.starts_with('/') {
                return Err(invalid(format!(
                    "{}: path_prefix '{}' must start with '/'",
                    section, route.path_prefix
                )));
            }
            if !(route.upstream.starts_with("http://") || route.upstream.starts_with("https://")) {
                return Err(invalid(format!(
                    "{}: upstream '{}' must be an http(s) URL",
                    section, route.upstream
                )));
            }
            let normalized = route.path_prefix.trim_end_matches('/').to_string();
            if !prefixes.insert(normalized) {
                return Err(invalid(format!("{}: duplicate path_prefix '{}'", section, route.path_prefix)));
            }
            for user in &route.allowed_users {
                if !self.credentials.contains_key(user) {
                    return Err(invalid(format!("{}: allowed user '{}' has no credentials", section, user)));
                }
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Backlot Configuration
# Environment variables (BACKLOT_*) override these settings

[broker]
backend = "sqlite"  # sqlite or memory
database_url = "sqlite://data/backlot.db"
max_connections = 5
visibility_timeout_secs = 300
poll_interval_ms = 500
default_queue = "default"
enqueue_max_attempts = 5
enqueue_backoff_ms = 200
enqueue_backoff_max_ms = 5000

[broker.default_retry]
max_retries = 3
base_delay_ms = 1000
backoff_multiplier = 2.0

[results]
# database_url = "sqlite://data/results.db"  # defaults to broker.database_url
result_ttl_secs = 86400

[worker]
concurrency = 4
queues = ["high", "default"]
starvation_limit = 8
task_timeout_secs = 120
heartbeat_interval_secs = 10
stale_after_secs = 60
shutdown_grace_secs = 30

[scheduler]
enabled = true
tick_interval_ms = 1000

[[scheduler.entries]]
name = "delete-expired-activation-tokens"
task = "delete_expired_activation_tokens"
every_secs = 86400

[[scheduler.entries]]
name = "purge-expired-results"
task = "backlot.purge_expired_results"
cron = "0 * * * *"
jitter_secs = 30

[leader]
backend = "redis"  # redis or memory
redis_url = "redis://localhost:6379/0"
lock_key = "backlot:scheduler:leader"
ttl_secs = 30
refresh_interval_ms = 1000

[monitor]
host = "0.0.0.0"
port = 8090
admin_users = ["admin"]
histogram_window_secs = 3600

[credentials]
# Placeholder hash; generate real ones with: bl-gateway hash-password <password>
admin = "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$3yJ2tMQO2OQ3E9iH7m2T3wXGdx8n6Y5o2bX6r5aC3kA"

[[integrations]]
task = "send_activation_email"
endpoint = "http://api:8000/internal/notifications/activation"

[[integrations]]
task = "send_activation_complete_email"
endpoint = "http://api:8000/internal/notifications/activation-complete"

[[integrations]]
task = "send_password_reset_email"
endpoint = "http://api:8000/internal/notifications/password-reset"

[[integrations]]
task = "send_password_reset_complete_email"
endpoint = "http://api:8000/internal/notifications/password-reset-complete"

[[integrations]]
task = "send_stripe_payment_success_email"
endpoint = "http://api:8000/internal/notifications/payment-success"

[[integrations]]
task = "delete_expired_activation_tokens"
endpoint = "http://api:8000/internal/maintenance/activation-tokens/expired"
timeout_secs = 300

[gateway]
server_name = "backlot.example.com"
https_addr = "0.0.0.0:443"
http_addr = "0.0.0.0:80"
tls_cert_path = "/etc/backlot/tls/fullchain.pem"
tls_key_path = "/etc/backlot/tls/privkey.pem"
connect_timeout_ms = 5000
upstream_timeout_ms = 60000

[[gateway.routes]]
path_prefix = "/"
upstream = "http://api:8000"

[[gateway.routes]]
path_prefix = "/docs"
upstream = "http://api:8000"
auth_required = true

[[gateway.routes]]
path_prefix = "/openapi.json"
upstream = "http://api:8000"
auth_required = true

[[gateway.routes]]
path_prefix = "/monitoring"
upstream = "http://monitor:8090"
auth_required = true

[[gateway.routes]]
path_prefix = "/pgadmin"
upstream = "http://pgadmin:80"
auth_required = true
allowed_users = ["admin"]

[[gateway.routes]]
path_prefix = "/minio"
upstream = "http://minio:9001"
auth_required = true
strip_prefix = true

[gateway.cache_ui]
enabled = true
https_addr = "0.0.0.0:8444"

[[gateway.cache_ui.routes]]
path_prefix = "/"
upstream = "http://redis-commander:8081"
auth_required = true
allowed_users = ["admin"]
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig::default()
    }

    #[test]
    fn test_defaults_validate() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_example_toml_parses_and_validates() {
        let config = AppConfig::from_toml(&AppConfig::example_toml()).unwrap();
        assert_eq!(config.worker.queues, vec!["high", "default"]);
        assert_eq!(config.scheduler.entries.len(), 2);
        assert_eq!(config.gateway.routes.len(), 6);
        assert_eq!(config.integrations.len(), 6);
        assert!(config.gateway.cache_ui.enabled);
        assert_eq!(config.gateway.routes[4].allowed_users, vec!["admin"]);
        config.validate().unwrap();
        config.gateway.validate_listeners().unwrap();
    }

    #[test]
    fn test_task_catalog_includes_builtin() {
        let config = AppConfig::from_toml(&AppConfig::example_toml()).unwrap();
        let catalog = config.task_catalog();
        assert!(catalog.contains("send_activation_email"));
        assert!(catalog.contains(PURGE_EXPIRED_RESULTS_TASK));
    }

    #[test]
    fn test_task_timeout_must_fit_visibility() {
        let mut config = valid();
        config.worker.task_timeout_secs = config.broker.visibility_timeout_secs;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_empty_queue_list_rejected() {
        let mut config = valid();
        config.worker.queues.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schedule_trigger_exclusive() {
        let mut config = valid();
        config.scheduler.entries.push(ScheduleEntryConfig {
            name: "both".into(),
            task: "t".into(),
            every_secs: Some(60),
            cron: Some("* * * * *".into()),
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.scheduler.entries[0].cron = None;
        config.validate().unwrap();
    }

    #[test]
    fn test_leader_refresh_bounded_by_tick() {
        let mut config = valid();
        config.leader.refresh_interval_ms = config.scheduler.tick_interval_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_route_prefix_must_be_absolute() {
        let mut config = valid();
        config.gateway.routes.push(RouteConfig {
            path_prefix: "api".into(),
            upstream: "http://api:8000".into(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_allowed_users_need_credentials() {
        let mut config = valid();
        config.gateway.routes.push(RouteConfig {
            path_prefix: "/admin".into(),
            upstream: "http://admin:80".into(),
            auth_required: true,
            allowed_users: vec!["root".into()],
            ..Default::default()
        });
        assert!(config.validate().is_err());

        config.credentials.insert("root".into(), "hash".into());
        config.validate().unwrap();
    }

    #[test]
    fn test_entry_enabled_by_default() {
        let config = AppConfig::from_toml(
            r#"
            [[scheduler.entries]]
            name = "n"
            task = "t"
            every_secs = 5
            "#,
        )
        .unwrap();
        assert!(config.scheduler.entries[0].enabled);
    }

    #[test]
    fn test_results_url_falls_back_to_broker() {
        let mut config = valid();
        assert_eq!(config.results_database_url(), config.broker.database_url);
        config.results.database_url = Some("sqlite::memory:".into());
        assert_eq!(config.results_database_url(), "sqlite::memory:");
    }
}
