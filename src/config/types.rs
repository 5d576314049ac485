//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub listen_addr: String,
    /// Fixed address every accepted connection is relayed to
    pub target_addr: String,
    /// Account to switch to after binding
    pub run_as: Option<String>,
    /// Upper bound on one wait for I/O readiness
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long a finishing connection may take to drain before it is closed
    #[serde(with = "humantime_serde")]
    pub finish_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Read chunk size per connection
    pub buffer_size: usize,
    /// Unsent bytes a connection may hold before its peer stops being read
    pub backlog_limit: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8443".to_string(),
            target_addr: "127.0.0.1:8080".to_string(),
            run_as: None,
            poll_interval: Duration::from_secs(1),
            finish_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            buffer_size: 16384,
            backlog_limit: 262144,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
