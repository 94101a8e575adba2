//! Configuration management.
//!
//! eduflow configuration can come from:
//! - Built-in defaults
//! - Config file (~/.config/eduflow/config.toml), every section optional
//! - Environment variables (EDUFLOW_*), applied last

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::engine::{EngineConfig, DEFAULT_MAX_STEPS, DEFAULT_NODE_TIMEOUT_SECS};
use crate::error::{Error, Result};

/// eduflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineSettings,

    /// Notification microservice
    #[serde(default)]
    pub notification: NotificationConfig,

    /// Tenant data store read by QUERY nodes and written by update handlers
    #[serde(default)]
    pub data: DataConfig,
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
    /// Path to the engine's SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Interpreter limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    #[serde(default = "default_node_timeout")]
    pub node_timeout_seconds: u64,

    /// Per-node default for COMBOT item concurrency
    #[serde(default = "default_combot_concurrency")]
    pub combot_max_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            node_timeout_seconds: default_node_timeout(),
            combot_max_concurrency: default_combot_concurrency(),
        }
    }
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_STEPS
}

fn default_node_timeout() -> u64 {
    DEFAULT_NODE_TIMEOUT_SECS
}

fn default_combot_concurrency() -> usize {
    4
}

/// Notification client configuration. Without a `base_url` sends are only logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_notification_timeout")]
    pub timeout_seconds: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_seconds: default_notification_timeout(),
        }
    }
}

fn default_notification_timeout() -> u64 {
    30
}

impl NotificationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

/// Tenant data store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConfig {
    /// Unset means the engine database doubles as the data store
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        if path.exists() {
            match Self::load_partial_from_path(&path) {
                Ok(partial) => config.apply_partial(partial),
                Err(e) => warn!("Ignoring config file {}: {}", path.display(), e),
            }
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Parse a TOML document over the built-in defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config = Self::default();
        let partial: PartialConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;
        config.apply_partial(partial);
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("eduflow"))
            .unwrap_or_else(|| PathBuf::from(".eduflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("eduflow"))
            .unwrap_or_else(|| PathBuf::from(".eduflow"))
    }

    /// Engine database path, defaulting to `<data_dir>/eduflow.db`.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("eduflow.db"))
    }

    /// Tenant data store path, defaulting to the engine database.
    pub fn data_database_path(&self) -> PathBuf {
        self.data
            .database_path
            .clone()
            .unwrap_or_else(|| self.database_path())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_steps: self.engine.max_steps.max(1),
            node_timeout_seconds: self.engine.node_timeout_seconds.max(1),
        }
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(port) = var("EDUFLOW_SERVER_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => self.server.port = parsed,
                Err(_) => warn!("Ignoring invalid EDUFLOW_SERVER_PORT '{}'", port),
            }
        }
        if let Some(host) = var("EDUFLOW_SERVER_HOST") {
            self.server.host = host;
        }
        if let Some(path) = var("EDUFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("EDUFLOW_DATA_DATABASE_PATH") {
            self.data.database_path = Some(PathBuf::from(path));
        }
        if let Some(url) = var("EDUFLOW_NOTIFICATION_URL") {
            self.notification.base_url = Some(url);
        }
        if let Some(key) = var("EDUFLOW_NOTIFICATION_API_KEY") {
            self.notification.api_key = Some(key);
        }
        if let Some(steps) = var("EDUFLOW_MAX_STEPS") {
            if let Ok(parsed) = steps.parse::<usize>() {
                self.engine.max_steps = parsed;
            }
        }
        if let Some(timeout) = var("EDUFLOW_NODE_TIMEOUT_SECONDS") {
            if let Ok(parsed) = timeout.parse::<u64>() {
                self.engine.node_timeout_seconds = parsed;
            }
        }
    }

    fn load_partial_from_path(path: &Path) -> Result<PartialConfig> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
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
        if let Some(notification) = partial.notification {
            self.notification = notification;
        }
        if let Some(data) = partial.data {
            self.data = data;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    server: Option<ServerConfig>,
    storage: Option<StorageConfig>,
    engine: Option<EngineSettings>,
    notification: Option<NotificationConfig>,
    data: Option<DataConfig>,
}
