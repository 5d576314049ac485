//! Connection Management Module
//!
//! Connection registry, socket I/O and the dispatch loop.

pub mod engine;
pub mod io;
pub mod manager;
pub mod table;

pub use engine::{EventEngine, EventHandler, PendingConnect, RelayEvent};
pub use manager::{ConnectionManager, ManagerState, ManagerStats};
pub use table::{ConnFlags, ConnId, ConnState, Connection, ConnectionTable, Role};
