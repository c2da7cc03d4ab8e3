use crate::rendezvous::RendezvousStats;
use crate::signaling::TransportStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Offline,
    /// Running with nothing connected or in flight
    Waiting,
    Connecting,
    Online,
}

/// Aggregate node statistics, rebuilt on every poll tick
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct P2PStats {
    pub status: NodeStatus,
    pub connected_peers: usize,
    pub connecting_peers: usize,
    pub discovered_peers: usize,
    pub local_content: usize,
    pub remote_content: usize,
    pub pending_inbound: usize,
    pub rendezvous: RendezvousStats,
    pub transport: TransportStats,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connection_attempts: u64,
    pub rejected_inbound: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    /// Chunks served to other peers
    pub relay_count: u64,
    pub ping_count: u64,
    pub uptime_ms: u64,
    pub updated_at: u64,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Offline => "offline",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Connecting => "connecting",
            NodeStatus::Online => "online",
        }
    }

    pub fn derive(running: bool, connected: usize, connecting: usize) -> Self {
        if !running {
            NodeStatus::Offline
        } else if connected > 0 {
            NodeStatus::Online
        } else if connecting > 0 {
            NodeStatus::Connecting
        } else {
            NodeStatus::Waiting
        }
    }
}

/// Monotonic counters that survive restarts of the session
#[derive(Default)]
pub struct Counters {
    pub connection_attempts: AtomicU64,
    pub successful_connections: AtomicU64,
    pub failed_connection_attempts: AtomicU64,
    pub rejected_inbound: AtomicU64,
    pub relay_count: AtomicU64,
    pub ping_count: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
