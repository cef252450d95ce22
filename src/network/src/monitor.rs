//! Network load accounting.

use crate::connection::{CloseReason, Connection, ConnectionId};
use crate::envelope::Payload;
use crate::node::NodeListener;
use common::addressing::NetworkIdentity;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters of one unit's traffic, fed by node events.
#[derive(Default)]
pub struct NetworkLoadMonitor {
    received: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
}

/// Point-in-time traffic snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkLoadSnapshot {
    /// Authorized inbound payloads seen
    pub received: u64,
    /// Connections established
    pub connections_opened: u64,
    /// Connections torn down
    pub connections_closed: u64,
}

impl NetworkLoadMonitor {
    /// Creates a monitor with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter values.
    pub fn snapshot(&self) -> NetworkLoadSnapshot {
        NetworkLoadSnapshot {
            received: self.received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
        }
    }
}

impl NodeListener for NetworkLoadMonitor {
    fn on_message(&self, _payload: &Payload, _connection: &Connection, _identity: &NetworkIdentity) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn on_connection(&self, _connection: &Connection) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    fn on_disconnect(&self, _connection_id: ConnectionId, _reason: CloseReason) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}
