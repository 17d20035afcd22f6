//! Configuration management.
//!
//! opsflow configuration can come from:
//! - Environment variables (OPSFLOW_*)
//! - Config file (~/.config/opsflow/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// opsflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Execution engine limits
    #[serde(default)]
    pub engine: EngineSettings,

    /// Cron and resume polling
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    /// Built-in action tuning
    #[serde(default)]
    pub actions: ActionSettings,

    /// Version history
    #[serde(default)]
    pub versions: VersionSettings,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured path, or `opsflow.db` in the data directory.
    pub fn resolved_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("opsflow.db"))
    }
}

/// Execution engine limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,

    /// Wall-clock ceiling for one running segment of an execution.
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_seconds: u64,

    #[serde(default = "default_max_steps")]
    pub max_steps_per_execution: usize,

    #[serde(default = "default_max_depth")]
    pub max_subworkflow_depth: u32,

    /// How long a sync trigger waits before returning the latest snapshot.
    #[serde(default = "default_sync_wait")]
    pub sync_wait_timeout_seconds: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub subworkflow_poll_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent(),
            max_execution_time_seconds: default_max_execution_time(),
            max_steps_per_execution: default_max_steps(),
            max_subworkflow_depth: default_max_depth(),
            sync_wait_timeout_seconds: default_sync_wait(),
            subworkflow_poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl EngineSettings {
    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time_seconds)
    }

    pub fn sync_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_wait_timeout_seconds)
    }

    pub fn subworkflow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.subworkflow_poll_interval_ms.max(1))
    }
}

fn default_max_concurrent() -> usize {
    10
}

fn default_max_execution_time() -> u64 {
    3600
}

fn default_max_steps() -> usize {
    1000
}

fn default_max_depth() -> u32 {
    10
}

fn default_sync_wait() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_scheduler_poll")]
    pub poll_interval_seconds: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_scheduler_poll(),
        }
    }
}

impl SchedulerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }
}

fn default_scheduler_poll() -> u64 {
    30
}

/// Built-in action configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSettings {
    /// Delays shorter than this sleep in-task; longer ones suspend.
    #[serde(default = "default_short_delay")]
    pub short_delay_threshold_seconds: u64,

    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_seconds: u64,

    #[serde(default = "default_script_timeout")]
    pub script_timeout_ms: u64,

    /// Allow webhook actions to reach loopback and private addresses.
    #[serde(default)]
    pub allow_internal_urls: bool,

    /// Endpoint for AI actions. AI steps fail soft when unset.
    #[serde(default)]
    pub ai_endpoint: Option<String>,

    #[serde(default = "default_ai_timeout")]
    pub ai_timeout_seconds: u64,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            short_delay_threshold_seconds: default_short_delay(),
            webhook_timeout_seconds: default_webhook_timeout(),
            script_timeout_ms: default_script_timeout(),
            allow_internal_urls: false,
            ai_endpoint: None,
            ai_timeout_seconds: default_ai_timeout(),
        }
    }
}

impl ActionSettings {
    pub fn short_delay_threshold(&self) -> Duration {
        Duration::from_secs(self.short_delay_threshold_seconds)
    }
}

fn default_short_delay() -> u64 {
    300
}

fn default_webhook_timeout() -> u64 {
    30
}

fn default_script_timeout() -> u64 {
    2000
}

fn default_ai_timeout() -> u64 {
    20
}

/// Version history configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSettings {
    #[serde(default = "default_max_versions")]
    pub max_versions: usize,
}

impl Default for VersionSettings {
    fn default() -> Self {
        Self {
            max_versions: default_max_versions(),
        }
    }
}

fn default_max_versions() -> usize {
    50
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("Unknown log format: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Primary config file: ~/.config/opsflow/config.toml
        let primary_path = Self::config_dir().join("config.toml");
        if let Ok(partial) = Self::load_partial_from_path(&primary_path) {
            config.apply_partial(partial);
        }

        config.apply_env_overrides();
        config
    }

    /// Load from an explicit file, failing loudly on parse errors.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let partial: PartialConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut config = Self::default();
        config.apply_partial(partial);
        config.apply_env_overrides();
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("opsflow"))
            .unwrap_or_else(|| PathBuf::from(".opsflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("opsflow"))
            .unwrap_or_else(|| PathBuf::from(".opsflow"))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.parse().ok())
        }

        if let Some(port) = parsed(var("OPSFLOW_SERVER_PORT")) {
            self.server.port = port;
        }
        if let Some(host) = var("OPSFLOW_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(path) = var("OPSFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(n) = parsed(var("OPSFLOW_MAX_CONCURRENT_EXECUTIONS")) {
            self.engine.max_concurrent_executions = n;
        }
        if let Some(n) = parsed(var("OPSFLOW_MAX_EXECUTION_TIME_SECONDS")) {
            self.engine.max_execution_time_seconds = n;
        }
        if let Some(n) = parsed(var("OPSFLOW_MAX_STEPS_PER_EXECUTION")) {
            self.engine.max_steps_per_execution = n;
        }
        if let Some(n) = parsed(var("OPSFLOW_MAX_SUBWORKFLOW_DEPTH")) {
            self.engine.max_subworkflow_depth = n;
        }
        if let Some(n) = parsed(var("OPSFLOW_SCHEDULER_POLL_INTERVAL_SECONDS")) {
            self.scheduler.poll_interval_seconds = n;
        }
        if let Some(flag) = parsed(var("OPSFLOW_ALLOW_INTERNAL_URLS")) {
            self.actions.allow_internal_urls = flag;
        }
        if let Some(endpoint) = var("OPSFLOW_AI_ENDPOINT") {
            self.actions.ai_endpoint = Some(endpoint);
        }
        if let Some(n) = parsed(var("OPSFLOW_AI_TIMEOUT_SECONDS")) {
            self.actions.ai_timeout_seconds = n;
        }
        if let Some(n) = parsed(var("OPSFLOW_MAX_VERSIONS")) {
            self.versions.max_versions = n;
        }
        if let Some(format) = parsed(var("OPSFLOW_LOG_FORMAT")) {
            self.logging.format = format;
        }
    }

    fn load_partial_from_path(path: &Path) -> std::result::Result<PartialConfig, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_partial(&mut self, partial: PartialConfig) {
        if let Some(server) = partial.server {
            self.server = server;
        }
        if let Some(storage) = partial.storage {
            self.storage = storage;
        }
        if let Some(engine) = partial.engine {
            self.engine = engine;
        }
        if let Some(scheduler) = partial.scheduler {
            self.scheduler = scheduler;
        }
        if let Some(actions) = partial.actions {
            self.actions = actions;
        }
        if let Some(versions) = partial.versions {
            self.versions = versions;
        }
        if let Some(logging) = partial.logging {
            self.logging = logging;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    engine: Option<EngineSettings>,
    scheduler: Option<SchedulerSettings>,
    actions: Option<ActionSettings>,
    versions: Option<VersionSettings>,
    logging: Option<LoggingConfig>,
}
