//! Event Engine
//!
//! Synchronous connection registry the dispatch loop drives. It owns every
//! `Connection`, hands out receive buffers and send queues, and delivers
//! lifecycle events to a single `EventHandler`. Socket I/O lives elsewhere;
//! the engine only records what the I/O side must act on next.

use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::debug;

use super::table::{ConnFlags, ConnId, ConnState, Connection, ConnectionTable, Role};
use crate::config::Endpoint;
use crate::error::RelayError;

/// Lifecycle events delivered to the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// A new inbound connection was accepted
    Accepted,
    /// Bytes were appended to the connection's receive buffer
    DataReceived,
    /// The connection is about to be released
    Closing,
}

/// Callback invoked for every engine event
pub trait EventHandler {
    fn handle(&mut self, engine: &mut EventEngine, id: ConnId, event: RelayEvent);
}

/// Outbound connect initiated but not yet handed to the I/O side
#[derive(Debug, Clone)]
pub struct PendingConnect {
    pub id: ConnId,
    pub target: Endpoint,
}

/// Registry of live connections and their buffers
#[derive(Debug, Default)]
pub struct EventEngine {
    table: ConnectionTable,
    dirty: Vec<ConnId>,
    pending_connects: Vec<PendingConnect>,
}

impl EventEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.table.get(id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.table.ids()
    }

    /// Register an accepted inbound connection
    pub fn register_inbound(&mut self, remote: SocketAddr) -> ConnId {
        let id = self.table.insert(Connection::new(
            Role::Inbound,
            ConnState::Established,
            remote.to_string(),
        ));
        debug!("Registered inbound connection {} from {}", id, remote);
        id
    }

    /// Initiate an outbound connection.
    ///
    /// Only the address is checked here; resolution and the TCP handshake
    /// complete later and report back through the I/O side.
    pub fn connect(&mut self, target: &str) -> Result<ConnId, RelayError> {
        let endpoint = Endpoint::parse_target(target).map_err(|e| RelayError::connect(target, e))?;

        let id = self.table.insert(Connection::new(
            Role::Outbound,
            ConnState::Connecting,
            endpoint.to_string(),
        ));
        self.pending_connects.push(PendingConnect {
            id,
            target: endpoint,
        });
        debug!("Initiated outbound connection {} to {}", id, target);
        Ok(id)
    }

    pub fn peer(&self, id: ConnId) -> Option<ConnId> {
        self.table.get(id).and_then(Connection::peer)
    }

    /// Set or clear the peer link stored on `id`
    pub fn set_peer(&mut self, id: ConnId, peer: Option<ConnId>) {
        if let Some(conn) = self.table.get_mut(id) {
            conn.peer = peer;
        }
    }

    /// Append to the send queue. Returns false if nothing can be sent on `id`.
    pub fn send(&mut self, id: ConnId, data: &[u8]) -> bool {
        let Some(conn) = self.table.get_mut(id) else {
            return false;
        };
        if conn.flags.contains(ConnFlags::CLOSE_IMMEDIATELY) || conn.is_closing() {
            return false;
        }
        conn.send_queue.extend_from_slice(data);
        self.dirty.push(id);
        true
    }

    /// Take the whole receive buffer, leaving it empty
    pub fn take_recv(&mut self, id: ConnId) -> BytesMut {
        self.table
            .get_mut(id)
            .map(|conn| conn.recv_buf.split())
            .unwrap_or_default()
    }

    pub fn set_flags(&mut self, id: ConnId, flags: ConnFlags) {
        if let Some(conn) = self.table.get_mut(id) {
            conn.flags.insert(flags);
            self.dirty.push(id);
        }
    }

    /// Append bytes read from the socket to the receive buffer
    pub fn deliver(&mut self, id: ConnId, data: &[u8]) -> bool {
        match self.table.get_mut(id) {
            Some(conn) if !conn.is_closing() => {
                conn.recv_buf.extend_from_slice(data);
                true
            }
            _ => false,
        }
    }

    /// Record a completed outbound connect
    pub fn mark_established(&mut self, id: ConnId, remote: SocketAddr) -> bool {
        match self.table.get_mut(id) {
            Some(conn) => {
                conn.state = ConnState::Established;
                conn.remote = remote.to_string();
                // Whatever was queued while connecting can go out now
                self.dirty.push(id);
                true
            }
            None => false,
        }
    }

    /// Take queued outbound bytes of an established connection
    pub fn take_send_queue(&mut self, id: ConnId) -> Option<Bytes> {
        let conn = self.table.get_mut(id)?;
        if conn.state != ConnState::Established || conn.send_queue.is_empty() {
            return None;
        }
        Some(conn.send_queue.split().freeze())
    }

    /// Connections whose send queue or flags changed since the last call
    pub fn take_dirty(&mut self) -> Vec<ConnId> {
        let mut dirty = std::mem::take(&mut self.dirty);
        let mut seen = HashSet::with_capacity(dirty.len());
        dirty.retain(|id| seen.insert(*id));
        dirty
    }

    pub fn take_pending_connects(&mut self) -> Vec<PendingConnect> {
        std::mem::take(&mut self.pending_connects)
    }

    /// Deliver an event to the handler
    pub fn dispatch<H: EventHandler>(&mut self, handler: &mut H, id: ConnId, event: RelayEvent) {
        if self.table.contains(id) {
            handler.handle(self, id, event);
        }
    }

    /// Deliver `Closing` exactly once, then release the connection
    pub fn close<H: EventHandler>(&mut self, handler: &mut H, id: ConnId) -> Option<Connection> {
        let conn = self.table.get_mut(id)?;
        if conn.is_closing() {
            return None;
        }
        conn.flags.insert(ConnFlags::CLOSING);

        handler.handle(self, id, RelayEvent::Closing);

        self.pending_connects.retain(|pending| pending.id != id);
        let conn = self.table.remove(id)?;
        debug!(
            "Released connection {} ({:?}, {}), {} bytes unsent",
            id,
            conn.role,
            conn.remote,
            conn.send_queue.len()
        );
        Some(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Vec<(ConnId, RelayEvent)>,
    }

    impl EventHandler for Recorder {
        fn handle(&mut self, _engine: &mut EventEngine, id: ConnId, event: RelayEvent) {
            self.events.push((id, event));
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_connect_initiation_parses_target() {
        let mut engine = EventEngine::new();
        let id = engine.connect("127.0.0.1:9000").unwrap();

        let conn = engine.get(id).unwrap();
        assert_eq!(conn.role, Role::Outbound);
        assert_eq!(conn.state, ConnState::Connecting);

        let pending = engine.take_pending_connects();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].target.port, 9000);
        assert!(engine.take_pending_connects().is_empty());
    }

    #[test]
    fn test_connect_initiation_failure_allocates_nothing() {
        let mut engine = EventEngine::new();
        let err = engine.connect("no-port-here").unwrap_err();
        assert!(matches!(err, RelayError::ConnectInitiation { .. }));
        assert!(engine.is_empty());
        assert!(engine.take_pending_connects().is_empty());
    }

    #[test]
    fn test_send_queue_held_until_established() {
        let mut engine = EventEngine::new();
        let id = engine.connect("127.0.0.1:9000").unwrap();

        assert!(engine.send(id, b"early"));
        assert!(engine.take_send_queue(id).is_none());

        engine.mark_established(id, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(engine.take_send_queue(id).unwrap(), Bytes::from_static(b"early"));
        assert!(engine.take_send_queue(id).is_none());
    }

    #[test]
    fn test_take_recv_drains() {
        let mut engine = EventEngine::new();
        let id = engine.register_inbound(addr());
        engine.deliver(id, b"abc");
        engine.deliver(id, b"def");

        assert_eq!(&engine.take_recv(id)[..], b"abcdef");
        assert!(engine.take_recv(id).is_empty());
        assert!(engine.get(id).unwrap().recv_buf().is_empty());
    }

    #[test]
    fn test_close_delivers_closing_once() {
        let mut engine = EventEngine::new();
        let mut recorder = Recorder::default();
        let id = engine.register_inbound(addr());

        assert!(engine.close(&mut recorder, id).is_some());
        assert!(engine.close(&mut recorder, id).is_none());
        assert_eq!(recorder.events, vec![(id, RelayEvent::Closing)]);
        assert!(engine.get(id).is_none());
    }

    #[test]
    fn test_close_of_connecting_drops_pending_connect() {
        let mut engine = EventEngine::new();
        let mut recorder = Recorder::default();
        let id = engine.connect("127.0.0.1:9000").unwrap();

        engine.close(&mut recorder, id);
        assert!(engine.take_pending_connects().is_empty());
    }

    #[test]
    fn test_dispatch_ignores_released_connection() {
        let mut engine = EventEngine::new();
        let mut recorder = Recorder::default();
        let id = engine.register_inbound(addr());
        engine.close(&mut recorder, id);

        engine.dispatch(&mut recorder, id, RelayEvent::DataReceived);
        assert_eq!(recorder.events.len(), 1);
        assert!(!engine.send(id, b"late"));
        assert!(!engine.deliver(id, b"late"));
    }

    #[test]
    fn test_take_dirty_reports_each_connection_once() {
        let mut engine = EventEngine::new();
        let a = engine.register_inbound(addr());
        let b = engine.register_inbound(addr());

        engine.set_flags(a, ConnFlags::FINISH_SENDING);
        engine.send(b, b"x");
        engine.send(a, b"y");
        engine.set_flags(a, ConnFlags::FINISH_SENDING);

        assert_eq!(engine.take_dirty(), vec![a, b]);
        assert!(engine.take_dirty().is_empty());
    }
}
