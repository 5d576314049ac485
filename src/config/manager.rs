//! Configuration Manager

use super::{Config, Endpoint};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "RUSTRELAY_";

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from `RUSTRELAY_*` environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(format!("{}{}", ENV_PREFIX, name).as_str());
        let mut config = Config::default();

        if let Some(listen) = var("LISTEN_ADDR") {
            config.server.listen_addr = listen;
        }

        if let Some(target) = var("TARGET_ADDR") {
            config.server.target_addr = target;
        }

        if let Some(user) = var("RUN_AS") {
            config.server.run_as = Some(user);
        }

        if let Some(interval) = var("POLL_INTERVAL") {
            config.server.poll_interval = parse_duration_var("POLL_INTERVAL", &interval)?;
        }

        if let Some(timeout) = var("FINISH_TIMEOUT") {
            config.server.finish_timeout = parse_duration_var("FINISH_TIMEOUT", &timeout)?;
        }

        if let Some(timeout) = var("CONNECT_TIMEOUT") {
            config.server.connect_timeout = parse_duration_var("CONNECT_TIMEOUT", &timeout)?;
        }

        if let Some(buffer_size) = var("BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid {}BUFFER_SIZE: {}", ENV_PREFIX, buffer_size))?;
        }

        if let Some(limit) = var("BACKLOG_LIMIT") {
            config.server.backlog_limit = limit
                .parse::<usize>()
                .with_context(|| format!("Invalid {}BACKLOG_LIMIT: {}", ENV_PREFIX, limit))?;
        }

        if let Some(level) = var("LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_duration_var(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .with_context(|| format!("Invalid {}{}: {}", ENV_PREFIX, name, value))
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        if self.server.listen_addr.trim().is_empty() {
            bail!("listen_addr must not be empty");
        }

        if self.server.target_addr.trim().is_empty() {
            bail!("target_addr must not be empty");
        }

        // The target is resolved per connection; a bad one only fails those connections
        if let Err(e) = Endpoint::parse_target(&self.server.target_addr) {
            tracing::warn!(
                "target_addr '{}' is not usable, every relayed connection will be closed: {}",
                self.server.target_addr,
                e
            );
        }

        if let Some(user) = &self.server.run_as {
            if user.trim().is_empty() {
                bail!("run_as must not be empty when set");
            }
        }

        if self.server.poll_interval.is_zero() {
            bail!("poll_interval must be greater than 0");
        }

        if self.server.poll_interval > Duration::from_secs(60) {
            bail!("poll_interval cannot exceed 60 seconds");
        }

        if self.server.finish_timeout.is_zero() {
            bail!("finish_timeout must be greater than 0");
        }

        if self.server.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.server.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.backlog_limit < self.server.buffer_size {
            bail!("backlog_limit must be at least buffer_size");
        }

        if self.server.backlog_limit > 268435456 {
            bail!("backlog_limit cannot exceed 256MB");
        }

        Ok(())
    }

    /// Validate logging configuration
    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!(
                "logging.level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        listen: Option<&str>,
        target: Option<&str>,
        run_as: Option<&str>,
        log_level: Option<&str>,
    ) {
        if let Some(listen) = listen {
            self.server.listen_addr = listen.to_string();
            tracing::info!("CLI override: listen address set to {}", listen);
        }

        if let Some(target) = target {
            self.server.target_addr = target.to_string();
            tracing::info!("CLI override: target address set to {}", target);
        }

        if let Some(user) = run_as {
            self.server.run_as = Some(user.to_string());
            tracing::info!("CLI override: privileges will be dropped to '{}'", user);
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.server.buffer_size = 512;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.finish_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.backlog_limit = config.server.buffer_size - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unparseable_target_is_not_fatal() {
        let mut config = Config::default();
        config.server.target_addr = "not a target".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("RUSTRELAY_LISTEN_ADDR", "0.0.0.0:443"),
            ("RUSTRELAY_TARGET_ADDR", "backend.local:80"),
            ("RUSTRELAY_RUN_AS", "nobody"),
            ("RUSTRELAY_FINISH_TIMEOUT", "5s"),
            ("RUSTRELAY_BUFFER_SIZE", "4096"),
            ("RUSTRELAY_BACKLOG_LIMIT", "65536"),
        ]
        .into_iter()
        .collect();

        let config =
            ConfigManager::load_from_vars(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:443");
        assert_eq!(config.server.target_addr, "backend.local:80");
        assert_eq!(config.server.run_as.as_deref(), Some("nobody"));
        assert_eq!(config.server.finish_timeout, Duration::from_secs(5));
        assert_eq!(config.server.buffer_size, 4096);
        assert_eq!(config.server.backlog_limit, 65536);
        assert_eq!(config.server.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_vars_rejects_bad_duration() {
        let result = ConfigManager::load_from_vars(|key| {
            (key == "RUSTRELAY_POLL_INTERVAL").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_args_override() {
        let mut config = Config::default();
        config.merge_with_cli_args(Some("9000"), Some("10.0.0.1:22"), Some("relay"), None);
        assert_eq!(config.server.listen_addr, "9000");
        assert_eq!(config.server.target_addr, "10.0.0.1:22");
        assert_eq!(config.server.run_as.as_deref(), Some("relay"));
        assert_eq!(config.logging.level, "info");
    }
}
