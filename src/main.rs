//! RustRelay - Transparent TCP Relay
//!
//! Accepts connections on a local address and relays each one to a fixed
//! target, dropping root privileges once the listener is bound.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustrelay::{config::ConfigManager, ConnectionManager, ShutdownCoordinator};

/// CLI arguments for RustRelay
#[derive(Parser, Debug)]
#[command(name = "rustrelay")]
#[command(about = "RustRelay - Transparent TCP relay")]
#[command(version)]
#[command(long_about = "
RustRelay - Transparent TCP relay

Every connection accepted on <LISTENING_ADDRESS> is relayed byte for byte to
<TARGET_ADDRESS>. Addresses take the form PORT, HOST:PORT, [V6]:PORT, each
optionally prefixed with tcp://. After binding, a root process switches to
<DROP_PRIVILEGES_USER> and the group of the same name.

Tuning values come from --config, or from RUSTRELAY_* environment variables
when no config file is given:
  RUSTRELAY_POLL_INTERVAL      - Dispatch loop wait bound (e.g., 1s)
  RUSTRELAY_FINISH_TIMEOUT     - Drain bound for closing connections (e.g., 30s)
  RUSTRELAY_CONNECT_TIMEOUT    - Outbound connect bound (e.g., 10s)
  RUSTRELAY_BUFFER_SIZE        - Read chunk size in bytes
  RUSTRELAY_BACKLOG_LIMIT      - Unsent bytes per direction before reads pause
  RUSTRELAY_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Address to accept connections on
    pub listening_address: String,

    /// Address every connection is relayed to
    pub target_address: String,

    /// Account to switch to after binding
    pub drop_privileges_user: String,

    /// Configuration file path
    #[arg(short, long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => ConfigManager::load_from_file(path)?,
        None => ConfigManager::load_from_env()?,
    };

    config.merge_with_cli_args(
        Some(&args.listening_address),
        Some(&args.target_address),
        Some(&args.drop_privileges_user),
        args.log_level.as_deref(),
    );

    init_tracing(&args, &config.logging.level)?;

    config
        .validate()
        .context("Final configuration validation failed")?;

    info!(
        "Starting RustRelay v{}: {} -> {}",
        env!("CARGO_PKG_VERSION"),
        config.server.listen_addr,
        config.server.target_addr
    );

    // Handlers go in before binding so an early signal is not lost
    let coordinator = ShutdownCoordinator::new();
    let _signal_task = coordinator
        .install()
        .context("Failed to register signal handlers")?;

    let run_as = config.server.run_as.clone();
    let mut manager = ConnectionManager::init(Arc::new(config))
        .await
        .context("Failed to start relay")?;

    if let Some(user) = run_as.as_deref() {
        manager
            .drop_privileges(user)
            .context("Refusing to serve with original privileges")?;
    }

    manager.serve(coordinator.signal()).await?;

    info!("Relay shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        configured_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();

    Ok(())
}
