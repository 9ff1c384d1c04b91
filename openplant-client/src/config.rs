//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via OPENPLANT_CONFIG or --config)
//! 3. Environment variables

use crate::connection::ConnectionConfig;
use crate::subscription::SubscribeOptions;
use openplant_protocol::frame::{clamp_page_size, DEFAULT_PAGE_SIZE};
use openplant_protocol::{CompressMode, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Client configuration as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Per-operation timeout in seconds.
    pub timeout_secs: u64,
    /// Outbound frame compression.
    pub compress: CompressMode,
    /// Frame size including the 4-byte header.
    pub page_size: usize,
    /// Socket read chunk size.
    pub read_chunk_size: usize,
    pub subscription: SubscriptionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            user: "sis".to_string(),
            password: String::new(),
            timeout_secs: 60,
            compress: CompressMode::Raw,
            page_size: DEFAULT_PAGE_SIZE,
            read_chunk_size: crate::transport::DEFAULT_READ_CHUNK,
            subscription: SubscriptionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Loads configuration from `path` (or OPENPLANT_CONFIG when `None`),
    /// then applies environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var("OPENPLANT_CONFIG") {
                Ok(path) => Self::from_file(path)?,
                Err(_) => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse(_, msg) => ConfigError::Parse(path.to_path_buf(), msg),
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(PathBuf::new(), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides looked up by variable name.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("OPENPLANT_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("OPENPLANT_PORT").and_then(|v| v.parse().ok()) {
            self.port = port;
        }
        if let Some(user) = lookup("OPENPLANT_USER") {
            self.user = user;
        }
        if let Some(password) = lookup("OPENPLANT_PASSWORD") {
            self.password = password;
        }
        if let Some(secs) = lookup("OPENPLANT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.timeout_secs = secs;
        }
        if let Some(mode) = lookup("OPENPLANT_COMPRESS").and_then(|v| v.parse().ok()) {
            self.compress = mode;
        }
        if let Some(size) = lookup("OPENPLANT_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.page_size = size;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Validation("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation("port must not be 0".into()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation("timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Builds the connection settings; the page size is clamped here.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.host.clone(), self.port)
            .with_credentials(self.user.clone(), self.password.clone())
            .with_request_timeout(self.timeout())
            .with_page_size(clamp_page_size(self.page_size))
            .with_compress_mode(self.compress)
            .with_read_chunk_size(self.read_chunk_size)
    }

    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::default()
            .with_reconnect_interval(Duration::from_secs(self.subscription.reconnect_secs))
            .with_channel_capacity(self.subscription.channel_capacity)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }
}

/// Subscription tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Pause between reconnect attempts.
    pub reconnect_secs: u64,
    /// Capacity of the event channel.
    pub channel_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            reconnect_secs: 20,
            channel_capacity: 256,
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
