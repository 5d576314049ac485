//! Relay Handler
//!
//! Pairs every accepted connection with one outbound connection to the
//! configured target and moves bytes between them.
//!
//! The peer link is a `ConnId` stored on both connections. It is set on both
//! sides in the step that pairs them and cleared on both sides in the step
//! that handles the first `Closing` of either, so no event can reach a
//! released connection through a stale link.

use std::collections::HashMap;
use tracing::{debug, warn};

use super::session::RelaySession;
use crate::connection::{ConnFlags, ConnId, EventEngine, EventHandler, RelayEvent, Role};

/// Event callback implementing the relay
#[derive(Debug)]
pub struct RelayHandler {
    target: String,
    /// Keyed by the inbound side of each pair
    sessions: HashMap<ConnId, RelaySession>,
}

impl RelayHandler {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            sessions: HashMap::new(),
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, inbound: ConnId) -> Option<&RelaySession> {
        self.sessions.get(&inbound)
    }

    fn on_accept(&mut self, engine: &mut EventEngine, nc: ConnId) {
        match engine.connect(&self.target) {
            Ok(pc) => {
                engine.set_peer(nc, Some(pc));
                engine.set_peer(pc, Some(nc));

                let client = engine.get(nc).map(|c| c.remote.clone()).unwrap_or_default();
                let session = RelaySession::new(client, self.target.clone());
                debug!(
                    "Paired {} with {} (session {})",
                    nc, pc, session.session_id
                );
                self.sessions.insert(nc, session);
            }
            Err(e) => {
                warn!("Closing {}: {}", nc, e);
                engine.set_flags(nc, ConnFlags::CLOSE_IMMEDIATELY);
            }
        }
    }

    fn on_data(&mut self, engine: &mut EventEngine, nc: ConnId) {
        // Drained whether or not there is anywhere to forward it
        let data = engine.take_recv(nc);
        if data.is_empty() {
            return;
        }

        let Some(pc) = engine.peer(nc) else {
            debug!("Discarding {} bytes from unpaired {}", data.len(), nc);
            return;
        };

        if !engine.send(pc, &data) {
            return;
        }

        let len = data.len() as u64;
        match engine.get(nc).map(|c| c.role) {
            Some(Role::Inbound) => {
                if let Some(session) = self.sessions.get_mut(&nc) {
                    session.add_bytes_up(len);
                }
            }
            Some(Role::Outbound) => {
                if let Some(session) = self.sessions.get_mut(&pc) {
                    session.add_bytes_down(len);
                }
            }
            None => {}
        }
    }

    fn on_close(&mut self, engine: &mut EventEngine, nc: ConnId) {
        if let Some(pc) = engine.peer(nc) {
            debug!("{} closing, finishing peer {}", nc, pc);
            engine.set_flags(pc, ConnFlags::FINISH_SENDING);
            engine.set_peer(pc, None);
        }
        engine.set_peer(nc, None);

        if let Some(session) = self.sessions.remove(&nc) {
            session.log_stats();
        }
    }
}

impl EventHandler for RelayHandler {
    fn handle(&mut self, engine: &mut EventEngine, id: ConnId, event: RelayEvent) {
        match event {
            RelayEvent::Accepted => self.on_accept(engine, id),
            RelayEvent::DataReceived => self.on_data(engine, id),
            RelayEvent::Closing => self.on_close(engine, id),
        }
    }
}
