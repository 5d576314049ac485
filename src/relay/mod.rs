//! Data Relay Module
//!
//! Pairs inbound connections with outbound ones and forwards data between them.

pub mod handler;
pub mod session;

pub use handler::RelayHandler;
pub use session::RelaySession;
