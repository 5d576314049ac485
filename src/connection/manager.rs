//! Connection Manager Implementation
//!
//! Owns the listener, the event engine and the I/O handles of every
//! connection, and runs the single dispatch loop that feeds the relay handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::engine::{EventEngine, RelayEvent};
use super::io::{IoEvent, IoEventSender, IoHandle, IoLimits};
use super::table::{ConnFlags, ConnId, ConnState};
use crate::config::{Config, Endpoint};
use crate::error::RelayError;
use crate::privilege::{self, PrivilegeOutcome};
use crate::relay::RelayHandler;
use crate::shutdown::ShutdownSignal;

/// Upper bound on I/O events handled in one poll
const MAX_BATCH: usize = 1024;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after the given number of consecutive accept failures
fn accept_backoff(consecutive_errors: u32) -> Duration {
    let exp = consecutive_errors.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << exp)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Manager lifecycle. A manager value only exists once bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Bound,
    Serving,
    Draining,
    Stopped,
}

/// Counters reported at shutdown
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub active_connections: usize,
    pub active_sessions: usize,
    pub total_connections_accepted: u64,
}

enum Ready {
    Accept(std::io::Result<(TcpStream, SocketAddr)>),
    Io(IoEvent),
    Idle,
}

/// Accepts connections and drives the relay
pub struct ConnectionManager {
    config: Arc<Config>,
    limits: IoLimits,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    state: ManagerState,
    privileges_dropped: bool,
    engine: EventEngine,
    handler: RelayHandler,
    io: HashMap<ConnId, IoHandle>,
    events_tx: IoEventSender,
    events_rx: mpsc::UnboundedReceiver<IoEvent>,
    total_accepted: u64,
    accept_errors: u32,
}

impl ConnectionManager {
    /// Bind the listening socket.
    ///
    /// The target address is not checked here; it is parsed for every
    /// connection, so a bad target only fails those connections.
    pub async fn init(config: Arc<Config>) -> Result<Self, RelayError> {
        let listen = &config.server.listen_addr;
        let endpoint =
            Endpoint::parse_listen(listen).map_err(|e| RelayError::bind(listen.as_str(), e))?;

        info!("Binding TCP listener to {}", endpoint);
        let listener = match endpoint.socket_addr() {
            Some(addr) => TcpListener::bind(addr).await,
            None => TcpListener::bind((endpoint.host.to_string(), endpoint.port)).await,
        }
        .map_err(|e| RelayError::bind(listen.as_str(), e))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::bind(listen.as_str(), e))?;
        info!(
            "Listening on {}, relaying to {}",
            local_addr, config.server.target_addr
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handler = RelayHandler::new(config.server.target_addr.clone());

        Ok(Self {
            limits: IoLimits::from_config(&config.server),
            config,
            listener: Some(listener),
            local_addr,
            state: ManagerState::Bound,
            privileges_dropped: false,
            engine: EventEngine::new(),
            handler,
            io: HashMap::new(),
            events_tx,
            events_rx,
            total_accepted: 0,
            accept_errors: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            active_connections: self.engine.len(),
            active_sessions: self.handler.active_session_count(),
            total_connections_accepted: self.total_accepted,
        }
    }

    /// Switch to an unprivileged identity.
    ///
    /// Allowed once, after binding and before serving. A failed attempt
    /// still counts; the caller is expected to exit.
    pub fn drop_privileges(&mut self, user: &str) -> Result<PrivilegeOutcome, RelayError> {
        if self.state != ManagerState::Bound {
            return Err(RelayError::InvalidState(format!(
                "privileges can only be dropped before serving (state {:?})",
                self.state
            )));
        }
        if self.privileges_dropped {
            return Err(RelayError::InvalidState(
                "privileges were already dropped".to_string(),
            ));
        }
        self.privileges_dropped = true;
        privilege::drop_privileges(user)
    }

    /// Run the dispatch loop until `shutdown` is triggered, then release everything
    pub async fn serve(&mut self, shutdown: ShutdownSignal) -> Result<(), RelayError> {
        if self.state != ManagerState::Bound {
            return Err(RelayError::InvalidState(format!(
                "serve requires a bound manager (state {:?})",
                self.state
            )));
        }
        self.state = ManagerState::Serving;
        info!("Starting dispatch loop");

        let poll_interval = self.config.server.poll_interval;
        while !shutdown.is_triggered() {
            self.poll(poll_interval).await;
        }

        info!("Shutdown requested, releasing connections");
        self.teardown();
        Ok(())
    }

    /// Wait up to `wait` for readiness, then handle everything that is ready.
    /// Returns the number of events handled.
    pub async fn poll(&mut self, wait: Duration) -> usize {
        let Some(listener) = self.listener.as_ref() else {
            return 0;
        };

        let ready = tokio::select! {
            accepted = listener.accept() => Ready::Accept(accepted),
            event = self.events_rx.recv() => match event {
                Some(event) => Ready::Io(event),
                None => Ready::Idle,
            },
            _ = tokio::time::sleep(wait) => Ready::Idle,
        };

        let mut handled = match ready {
            Ready::Accept(Ok((stream, addr))) => {
                self.accept_errors = 0;
                self.on_accept(stream, addr);
                1
            }
            Ready::Accept(Err(e)) => {
                // Errors like EMFILE persist; do not spin on them
                self.accept_errors = self.accept_errors.saturating_add(1);
                let backoff = accept_backoff(self.accept_errors);
                error!("Error accepting connection: {} (retrying in {:?})", e, backoff);
                tokio::time::sleep(backoff).await;
                0
            }
            Ready::Io(event) => {
                self.on_io_event(event);
                1
            }
            Ready::Idle => 0,
        };

        while handled < MAX_BATCH {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    self.on_io_event(event);
                    handled += 1;
                }
                Err(_) => break,
            }
        }

        handled
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        self.total_accepted += 1;
        debug!("Accepted connection from {}", addr);

        let id = self.engine.register_inbound(addr);
        let mut handle = IoHandle::default();
        handle.attach(id, stream, self.limits, self.events_tx.clone());
        self.io.insert(id, handle);

        self.engine
            .dispatch(&mut self.handler, id, RelayEvent::Accepted);
        self.process_changes();
    }

    fn on_io_event(&mut self, event: IoEvent) {
        match event {
            IoEvent::Connected { id, stream } => {
                let remote = match stream.peer_addr() {
                    Ok(remote) => remote,
                    Err(e) => {
                        warn!("Outbound connection {} lost before use: {}", id, e);
                        self.close(id);
                        return;
                    }
                };
                if !self.engine.mark_established(id, remote) {
                    // Peer already gone, nothing to relay to
                    return;
                }
                info!("Outbound connection {} established to {}", id, remote);
                if let Some(handle) = self.io.get_mut(&id) {
                    handle.attach(id, stream, self.limits, self.events_tx.clone());
                }
            }
            IoEvent::ConnectFailed { id, error } => {
                warn!("Outbound connection {} failed: {}", id, error);
                self.close(id);
            }
            IoEvent::Data { id, data } => {
                if self.engine.deliver(id, &data) {
                    self.engine
                        .dispatch(&mut self.handler, id, RelayEvent::DataReceived);
                }
            }
            IoEvent::ReadClosed { id, error } => {
                match error {
                    Some(e) => debug!("Read error on {}: {}", id, e),
                    None => debug!("Connection {} closed by remote", id),
                }
                self.close(id);
            }
            IoEvent::WriteFailed { id, error } => {
                debug!("Write error on {}: {}", id, error);
                self.close(id);
            }
            IoEvent::Flushed { id } => {
                debug!("Connection {} finished sending", id);
                self.close(id);
            }
            IoEvent::Drained { id } => self.regulate(id),
            IoEvent::FinishExpired { id } => {
                if self.engine.get(id).is_some() {
                    warn!(
                        "Connection {} did not drain within {:?}, closing",
                        id, self.config.server.finish_timeout
                    );
                    self.close(id);
                }
            }
        }
        self.process_changes();
    }

    /// Deliver `Closing` and release the connection and its socket
    fn close(&mut self, id: ConnId) {
        if self.engine.close(&mut self.handler, id).is_some() {
            self.io.remove(&id);
        }
    }

    /// Act on send queues and flags touched by the handler
    fn process_changes(&mut self) {
        loop {
            for pending in self.engine.take_pending_connects() {
                let handle = IoHandle::connecting(
                    pending.id,
                    pending.target,
                    self.config.server.connect_timeout,
                    self.events_tx.clone(),
                );
                self.io.insert(pending.id, handle);
            }

            let dirty = self.engine.take_dirty();
            if dirty.is_empty() {
                break;
            }

            for id in dirty {
                let Some(conn) = self.engine.get(id) else {
                    continue;
                };
                let flags = conn.flags;
                let established = conn.state == ConnState::Established;

                if flags.contains(ConnFlags::CLOSE_IMMEDIATELY) {
                    self.close(id);
                    continue;
                }

                let queued = self.engine.take_send_queue(id);
                let Some(handle) = self.io.get_mut(&id) else {
                    continue;
                };
                if let Some(data) = queued {
                    handle.send(data);
                }
                if flags.contains(ConnFlags::FINISH_SENDING) {
                    handle.arm_finish_timer(
                        id,
                        self.config.server.finish_timeout,
                        self.events_tx.clone(),
                    );
                    if established && handle.is_attached() {
                        handle.request_finish();
                    }
                }
                self.regulate(id);
            }
        }
    }

    /// Pause or resume reading on the peer of `id` according to how much
    /// is still waiting to be written to `id`
    fn regulate(&mut self, id: ConnId) {
        let Some(source) = self.engine.peer(id) else {
            return;
        };
        let Some(handle) = self.io.get(&id) else {
            return;
        };
        let queued = self.engine.get(id).map_or(0, |conn| conn.send_queue().len());
        let mut backlog = queued + handle.backlog();
        let over = backlog > self.limits.high_water;
        if over {
            handle.request_drain_notice();
            // The writer may have drained before the notice was set
            backlog = queued + handle.backlog();
        }

        let Some(source_handle) = self.io.get_mut(&source) else {
            return;
        };
        if over && backlog > self.limits.low_water {
            if !source_handle.is_reading_paused() {
                debug!(
                    "Pausing reads on {}: {} bytes waiting for {}",
                    source, backlog, id
                );
                source_handle.pause_reading();
            }
        } else if backlog <= self.limits.low_water && source_handle.is_reading_paused() {
            debug!("Resuming reads on {}", source);
            source_handle.resume_reading();
        }
    }

    fn teardown(&mut self) {
        self.state = ManagerState::Draining;
        self.listener = None;

        for id in self.engine.ids() {
            self.close(id);
        }
        self.io.clear();

        self.state = ManagerState::Stopped;
        info!(
            total_connections_accepted = self.total_accepted,
            "Relay stopped"
        );
    }
}
