//! Configuration file loading tests

use anyhow::Result;
use rustrelay::config::ConfigManager;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_full_config_file() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("rustrelay.toml");
    fs::write(
        &config_path,
        r#"
[server]
listen_addr = "tcp://0.0.0.0:443"
target_addr = "backend.internal:8080"
run_as = "relay"
poll_interval = "250ms"
finish_timeout = "1m"
connect_timeout = "3s"
buffer_size = 32768
backlog_limit = 131072

[logging]
level = "debug"
"#,
    )?;

    let config = ConfigManager::load_from_file(&config_path)?;
    assert_eq!(config.server.listen_addr, "tcp://0.0.0.0:443");
    assert_eq!(config.server.target_addr, "backend.internal:8080");
    assert_eq!(config.server.run_as.as_deref(), Some("relay"));
    assert_eq!(config.server.poll_interval, Duration::from_millis(250));
    assert_eq!(config.server.finish_timeout, Duration::from_secs(60));
    assert_eq!(config.server.connect_timeout, Duration::from_secs(3));
    assert_eq!(config.server.buffer_size, 32768);
    assert_eq!(config.server.backlog_limit, 131072);
    assert_eq!(config.logging.level, "debug");

    Ok(())
}

#[test]
fn test_partial_config_uses_defaults() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("rustrelay.toml");
    fs::write(&config_path, "[server]\nfinish_timeout = \"5s\"\n")?;

    let config = ConfigManager::load_from_file(&config_path)?;
    assert_eq!(config.server.finish_timeout, Duration::from_secs(5));
    assert_eq!(config.server.poll_interval, Duration::from_secs(1));
    assert_eq!(config.server.run_as, None);
    assert_eq!(config.logging.level, "info");

    Ok(())
}

#[test]
fn test_missing_config_file_falls_back_to_defaults() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config = ConfigManager::load_from_file(&temp_dir.path().join("absent.toml"))?;
    assert_eq!(config.server.buffer_size, 16384);
    Ok(())
}

#[test]
fn test_invalid_config_file_is_rejected() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("rustrelay.toml");

    fs::write(&config_path, "invalid toml content [[[")?;
    assert!(ConfigManager::load_from_file(&config_path).is_err());

    fs::write(&config_path, "[server]\nbuffer_size = 10\n")?;
    assert!(ConfigManager::load_from_file(&config_path).is_err());

    Ok(())
}
