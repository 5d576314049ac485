//! Connection Table
//!
//! Generational arena holding every live connection. A `ConnId` carries the
//! slot generation it was issued for, so a handle kept after its connection
//! was removed never resolves to whatever later reuses the slot.

use bitflags::bitflags;
use bytes::BytesMut;
use std::fmt;

/// Handle to a connection in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}.{}", self.index, self.generation)
    }
}

bitflags! {
    /// Per-connection status flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u8 {
        /// Flush the send queue, then close
        const FINISH_SENDING    = 0b0000_0001;
        /// Close without flushing
        const CLOSE_IMMEDIATELY = 0b0000_0010;
        /// The closing event has been delivered
        const CLOSING           = 0b0000_0100;
    }
}

/// Which side of a relayed pair a connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Inbound,
    Outbound,
}

/// Socket lifecycle as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Outbound connect initiated but not resolved
    Connecting,
    Established,
}

/// One endpoint of a TCP stream
#[derive(Debug)]
pub struct Connection {
    pub role: Role,
    pub state: ConnState,
    /// Remote address, or the configured target while connecting
    pub remote: String,
    pub flags: ConnFlags,
    pub(crate) recv_buf: BytesMut,
    pub(crate) send_queue: BytesMut,
    pub(crate) peer: Option<ConnId>,
}

impl Connection {
    pub fn new(role: Role, state: ConnState, remote: impl Into<String>) -> Self {
        Self {
            role,
            state,
            remote: remote.into(),
            flags: ConnFlags::empty(),
            recv_buf: BytesMut::new(),
            send_queue: BytesMut::new(),
            peer: None,
        }
    }

    pub fn peer(&self) -> Option<ConnId> {
        self.peer
    }

    pub fn recv_buf(&self) -> &[u8] {
        &self.recv_buf
    }

    pub fn send_queue(&self) -> &[u8] {
        &self.send_queue
    }

    pub fn is_closing(&self) -> bool {
        self.flags.contains(ConnFlags::CLOSING)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Arena of live connections
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl ConnectionTable {
    pub fn insert(&mut self, conn: Connection) -> ConnId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.conn = Some(conn);
            return ConnId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            conn: Some(conn),
        });
        ConnId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_mut())
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    /// Remove a connection, retiring its handle
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let conn = slot.conn.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handles of every live connection
    pub fn ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.conn.is_some())
            .map(|(index, slot)| ConnId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.conn.as_ref().map(|conn| {
                (
                    ConnId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    conn,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound() -> Connection {
        Connection::new(Role::Inbound, ConnState::Established, "127.0.0.1:5000")
    }

    #[test]
    fn test_insert_and_get() {
        let mut table = ConnectionTable::default();
        let a = table.insert(inbound());
        let b = table.insert(inbound());

        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert!(table.get(a).is_some());
        assert!(table.get_mut(b).is_some());
    }

    #[test]
    fn test_stale_handle_does_not_resolve_after_reuse() {
        let mut table = ConnectionTable::default();
        let old = table.insert(inbound());
        assert!(table.remove(old).is_some());
        assert!(table.is_empty());

        let new = table.insert(Connection::new(
            Role::Outbound,
            ConnState::Connecting,
            "10.0.0.1:80",
        ));
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert!(table.remove(old).is_none());
        assert_eq!(table.get(new).map(|c| c.role), Some(Role::Outbound));
    }

    #[test]
    fn test_ids_lists_live_connections() {
        let mut table = ConnectionTable::default();
        let a = table.insert(inbound());
        let b = table.insert(inbound());
        let c = table.insert(inbound());
        table.remove(b);

        let ids = table.ids();
        assert_eq!(ids, vec![a, c]);
        assert_eq!(table.iter().count(), 2);
    }

    #[test]
    fn test_flags() {
        let mut flags = ConnFlags::empty();
        assert!(flags.is_empty());
        flags.insert(ConnFlags::FINISH_SENDING);
        assert!(flags.contains(ConnFlags::FINISH_SENDING));
        assert!(!flags.contains(ConnFlags::CLOSE_IMMEDIATELY));
        flags.insert(ConnFlags::CLOSING);
        assert!(flags.contains(ConnFlags::FINISH_SENDING));
        assert!(flags.contains(ConnFlags::CLOSING));
    }
}
