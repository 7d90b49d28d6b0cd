// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Configuration module

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::EngineConfig;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application name
    pub app_name: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Log level
    pub log_level: String,

    /// Broker session
    pub broker: BrokerConfig,

    /// Topic names
    pub topics: TopicConfig,

    /// Watchdog thresholds and cadences
    pub engine: EngineConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// HTTP ingress
    pub http: HttpConfig,

    /// Raw inbound message log
    pub signal_log: SignalLogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "BantayBike".to_string(),
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            broker: BrokerConfig::default(),
            topics: TopicConfig::default(),
            engine: EngineConfig::default(),
            database: DatabaseConfig::default(),
            http: HttpConfig::default(),
            signal_log: SignalLogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Load or create default configuration
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();

            // Create parent directories
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            config.save(path)?;
            Ok(config)
        }
    }

    /// Get configuration directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("bantaybike"))
            .unwrap_or_else(|| PathBuf::from("./config"))
    }

    /// Get default configuration path
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Apply `EMQX_*` / `PORT` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("EMQX_BROKER") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("EMQX_PORT") {
            match port.parse() {
                Ok(port) => self.broker.port = port,
                Err(_) => warn!("Ignoring invalid EMQX_PORT '{}'", port),
            }
        }
        if let Some(username) = lookup("EMQX_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("EMQX_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(ca) = lookup("EMQX_CA_CERT") {
            self.broker.ca_cert = Some(PathBuf::from(ca));
        }
        if let Some(topic) = lookup("EMQX_COMMAND_TOPIC") {
            self.topics.device_command = topic;
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.http.port = port,
                Err(_) => warn!("Ignoring invalid PORT '{}'", port),
            }
        }
    }

    /// Move the database and signal log under `dir`
    pub fn set_data_dir(&mut self, dir: PathBuf) {
        self.database.path = dir.join("bantaybike.db");
        self.signal_log.path = dir.join("signals.log");
        self.data_dir = dir;
    }

    /// Reject configurations the relay cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            bail!("broker host is empty (set broker.host or EMQX_BROKER)");
        }
        if self.broker.use_tls && (self.broker.username.is_none() || self.broker.password.is_none()) {
            bail!("TLS broker requires credentials (EMQX_USERNAME, EMQX_PASSWORD)");
        }
        if self.broker.retry.max_attempts == 0 {
            bail!("broker.retry.max_attempts must be at least 1");
        }
        if self.engine.tick_ms == 0 {
            bail!("engine.tick_ms must be positive");
        }
        Ok(())
    }
}

/// Broker session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Generated as `bantaybike-server-<n>` when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_cert: Option<PathBuf>,
    pub keep_alive_secs: u64,
    pub retry: RetryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            client_id: None,
            username: None,
            password: None,
            use_tls: true,
            ca_cert: Some(PathBuf::from("emqxsl-ca.crt")),
            keep_alive_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

/// Reconnect backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub first_delay_secs: u64,
    pub rate: u32,
    pub max_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            first_delay_secs: 1,
            rate: 2,
            max_delay_secs: 60,
            max_attempts: 12,
        }
    }
}

/// Logical channel names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    // Inbound
    pub command_request: String,
    pub diagnostics: String,
    pub test: String,

    // Outbound
    pub device_command: String,
    pub device_state: String,
    pub device_gps: String,
    pub device_mode: String,
    pub statistics: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            command_request: "command/lock-unlock".to_string(),
            diagnostics: "diagnostics/device".to_string(),
            test: "test/echo".to_string(),
            device_command: "device/command".to_string(),
            device_state: "device/state".to_string(),
            device_gps: "device/gps".to_string(),
            device_mode: "device/mode".to_string(),
            statistics: "mobile/statistics".to_string(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Enable database storage
    pub enabled: bool,

    /// Database path
    pub path: PathBuf,

    /// Retention period in days
    pub retention_days: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("./data/bantaybike.db"),
            retention_days: 30,
        }
    }
}

/// HTTP ingress configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Raw signal log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalLogConfig {
    pub enabled: bool,
    pub path: PathBuf,
}

impl Default for SignalLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: PathBuf::from("signals.log"),
        }
    }
}
