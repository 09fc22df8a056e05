//! Service host configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via MSGSWITCH_CONFIG or --config)
//! 3. Environment variables

use crate::server::ServerConfig;
use msgswitch_client::{ClientConfig, ConnectionConfig, Endpoint};
use msgswitch_protocol::DEFAULT_UNIX_SOCKET;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service host configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How to reach the broker.
    pub broker: BrokerConfig,
    /// What to serve.
    pub service: ServiceConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("MSGSWITCH_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides looked up by variable name.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.broker.apply_overrides(&lookup);
        self.service.apply_overrides(&lookup);
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.service.validate()
    }

    /// Server session settings for the configured service.
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::new(&self.broker.endpoint)
            .with_connection(self.broker.connection())
            .with_poll_timeout(self.broker.poll_timeout())
            .with_reconnect_delay(self.broker.reconnect_delay());
        if let Some(token) = &self.broker.token {
            config = config.with_token(token);
        }
        config
    }

    /// Client session settings for the configured broker.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(&self.broker.endpoint)
            .with_connection(self.broker.connection())
            .with_poll_timeout(self.broker.poll_timeout())
            .with_reconnect_delay(self.broker.reconnect_delay())
            .with_retry_delay(self.broker.retry_delay());
        if let Some(token) = &self.broker.token {
            config = config.with_token(token);
        }
        config
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.to_lowercase() == "true"
}

/// Broker connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker address: `host:port` or `unix:/path`.
    pub endpoint: String,
    /// Identity token. A random one is generated when unset.
    pub token: Option<String>,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    /// Long-poll timeout of each transfer.
    pub poll_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    /// Pause between attempts to submit a request (client sessions only).
    pub retry_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("unix:{DEFAULT_UNIX_SOCKET}"),
            token: None,
            connect_timeout_secs: 10,
            io_timeout_secs: 30,
            poll_timeout_secs: 5,
            reconnect_delay_ms: 1000,
            retry_delay_ms: 5000,
        }
    }
}

impl BrokerConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("MSGSWITCH_ENDPOINT") {
            self.endpoint = endpoint;
        }

        if let Some(token) = lookup("MSGSWITCH_TOKEN") {
            if !token.is_empty() {
                self.token = Some(token);
            }
        }

        if let Some(timeout) = lookup("MSGSWITCH_POLL_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.poll_timeout_secs = secs;
            }
        }

        if let Some(delay) = lookup("MSGSWITCH_RECONNECT_DELAY") {
            if let Ok(ms) = delay.parse() {
                self.reconnect_delay_ms = ms;
            }
        }

        if let Some(delay) = lookup("MSGSWITCH_RETRY_DELAY") {
            if let Ok(ms) = delay.parse() {
                self.retry_delay_ms = ms;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        Endpoint::parse(&self.endpoint).map_err(|e| {
            ConfigError::ValidationError(format!("invalid endpoint '{}': {}", self.endpoint, e))
        })?;
        if self.poll_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "poll_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 || self.io_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connection timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new()
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .with_io_timeout(Duration::from_secs(self.io_timeout_secs))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Served queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Persistent queue to serve.
    pub queue: String,
    /// Handle the requests of one poll concurrently.
    pub parallel: bool,
    /// Program run per request. Requests are echoed back when unset.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub program_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            parallel: false,
            program: None,
            args: Vec::new(),
            program_timeout_secs: 60,
        }
    }
}

impl ServiceConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(queue) = lookup("MSGSWITCH_QUEUE") {
            self.queue = queue;
        }

        if let Some(parallel) = lookup("MSGSWITCH_PARALLEL") {
            self.parallel = parse_flag(&parallel);
        }

        if let Some(program) = lookup("MSGSWITCH_PROGRAM") {
            self.program = Some(PathBuf::from(program));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.is_empty() {
            return Err(ConfigError::ValidationError(
                "service queue not set".to_string(),
            ));
        }
        if self.program.is_some() && self.program_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "program_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn program_timeout(&self) -> Duration {
        Duration::from_secs(self.program_timeout_secs)
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
