//! RustRelay Library
//!
//! Transparent TCP relay: every accepted connection is paired with one
//! outbound connection to a fixed target and bytes are copied both ways
//! until either side closes.

pub mod config;
pub mod connection;
pub mod error;
pub mod privilege;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use connection::ConnectionManager;
pub use error::RelayError;
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};

/// Common error type for configuration and startup
pub type Result<T> = anyhow::Result<T>;
