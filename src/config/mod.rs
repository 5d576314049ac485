//! Configuration Module
//!
//! Handles configuration loading, validation, and address parsing.

pub mod address;
pub mod manager;
pub mod types;

pub use address::{AddressError, Endpoint, TargetAddr};
pub use manager::ConfigManager;
pub use types::*;
