//! Relay counters and hub snapshots

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-scoped counters shared by the hub and the dispatcher
///
/// The connection counter also hands out connection indices, so every
/// connection accepted by this process gets a distinct, increasing index.
#[derive(Debug, Default)]
pub struct StatsCounter {
    connections: AtomicU64,
    broadcast_chat_messages: AtomicU64,
    unicast_chat_messages: AtomicU64,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection and return its index (starting at 1)
    pub fn next_connection(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Connections accepted so far
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn count_broadcast_chat(&self) {
        self.broadcast_chat_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count_unicast_chat(&self) {
        self.unicast_chat_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_chat_messages(&self) -> u64 {
        self.broadcast_chat_messages.load(Ordering::Relaxed)
    }

    pub fn unicast_chat_messages(&self) -> u64 {
        self.unicast_chat_messages.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the hub
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HubStats {
    /// Rooms with at least one local member
    pub rooms: usize,
    /// Clients with a live connection
    pub connections: usize,
    /// Sessions known to this node
    pub sessions: usize,
    /// Authenticated users
    pub users: usize,
    /// Connections accepted since start
    pub count: u64,
    pub broadcast_chat_messages: u64,
    pub unicast_chat_messages: u64,
}
