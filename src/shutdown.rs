//! Graceful Shutdown Handling
//!
//! SIGTERM and SIGINT set a shared flag. The dispatch loop checks it once per
//! poll, so shutdown takes effect at the next loop iteration and never
//! interrupts an event in the middle of being handled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::Result;

/// Shared shutdown flag
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Turns termination signals into a shutdown request
pub struct ShutdownCoordinator {
    signal: ShutdownSignal,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            signal: ShutdownSignal::new(),
        }
    }

    /// The flag this coordinator sets
    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    /// Register signal handlers and watch for signals in the background.
    ///
    /// Registration happens before this returns so a signal arriving during
    /// startup is not lost. Must be called from within a tokio runtime.
    pub fn install(&self) -> Result<JoinHandle<()>> {
        watch_signals(self.signal.clone())
    }
}

#[cfg(unix)]
fn watch_signals(shutdown: ShutdownSignal) -> Result<JoinHandle<()>> {
    use signal::unix::{signal as unix_signal, SignalKind};

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigint = unix_signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            if shutdown.is_triggered() {
                warn!("Received {} while already shutting down", name);
            } else {
                info!("Received {}, initiating graceful shutdown", name);
                shutdown.trigger();
            }
        }
    }))
}

#[cfg(not(unix))]
fn watch_signals(shutdown: ShutdownSignal) -> Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, initiating graceful shutdown");
            shutdown.trigger();
        }
    }))
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
