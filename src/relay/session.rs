//! Relay Session

use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Byte accounting for one inbound/outbound pair
#[derive(Debug)]
pub struct RelaySession {
    pub session_id: String,
    pub client_addr: String,
    pub target_addr: String,
    pub start_time: Instant,
    bytes_up: u64,
    bytes_down: u64,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(client_addr: impl Into<String>, target_addr: impl Into<String>) -> Self {
        let session = Self {
            session_id: Uuid::new_v4().to_string(),
            client_addr: client_addr.into(),
            target_addr: target_addr.into(),
            start_time: Instant::now(),
            bytes_up: 0,
            bytes_down: 0,
        };
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session.session_id, session.client_addr, session.target_addr
        );
        session
    }

    /// Bytes forwarded client to target
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    /// Bytes forwarded target to client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn add_bytes_up(&mut self, bytes: u64) {
        self.bytes_up += bytes;
    }

    pub fn add_bytes_down(&mut self, bytes: u64) {
        self.bytes_down += bytes;
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            target_addr = %self.target_addr,
            duration_ms = self.duration().as_millis() as u64,
            bytes_up = self.bytes_up,
            bytes_down = self.bytes_down,
            total_bytes = self.total_bytes(),
            "Relay session completed"
        );
    }
}
