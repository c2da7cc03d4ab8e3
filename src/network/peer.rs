// Copyright (C) 2026 Flux Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::rtc::{DataChannel, RtcConnection};
use crate::types::{ConnectionDirection, ManifestHash, PeerId, PeerState, UserId, now_ms};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A managed connection to one remote peer
pub struct PeerInfo {
    pub id: PeerId,
    pub user_id: UserId,
    pub connection: Arc<dyn RtcConnection>,
    pub data_channel: Option<Arc<dyn DataChannel>>,
    pub state: PeerState,
    pub available_content: HashSet<ManifestHash>,
    pub last_seen: u64,
    /// Last measured round-trip time in ms
    pub rtt: Option<u64>,
    pub retry_count: u32,
    pub direction: ConnectionDirection,
    pub connected_at: Option<u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Distinguishes this connection from the one it replaced
    pub generation: u64,
}

impl PeerInfo {
    pub fn new(
        id: PeerId,
        user_id: UserId,
        connection: Arc<dyn RtcConnection>,
        direction: ConnectionDirection,
        generation: u64,
    ) -> Self {
        Self {
            id,
            user_id,
            connection,
            data_channel: None,
            state: PeerState::Connecting,
            available_content: HashSet::new(),
            last_seen: now_ms(),
            rtt: None,
            retry_count: 0,
            direction,
            connected_at: None,
            bytes_sent: 0,
            bytes_received: 0,
            generation,
        }
    }

    pub fn channel_open(&self) -> bool {
        self.data_channel.as_ref().is_some_and(|channel| channel.is_open())
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        let mut available_content: Vec<ManifestHash> = self.available_content.iter().cloned().collect();
        available_content.sort();

        PeerSnapshot {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            state: self.state,
            direction: self.direction,
            available_content,
            last_seen: self.last_seen,
            rtt: self.rtt,
            retry_count: self.retry_count,
            connected_at: self.connected_at,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            channel_open: self.channel_open(),
        }
    }
}

/// Read-only copy of a peer entry handed to other components
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub user_id: UserId,
    pub state: PeerState,
    pub direction: ConnectionDirection,
    pub available_content: Vec<ManifestHash>,
    pub last_seen: u64,
    pub rtt: Option<u64>,
    pub retry_count: u32,
    pub connected_at: Option<u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub channel_open: bool,
}

/// Peer entries keyed by id
#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerInfo>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Insert an entry, returning the one it replaced
    pub fn insert(&mut self, info: PeerInfo) -> Option<PeerInfo> {
        self.peers.insert(info.id.clone(), info)
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    /// Remove only if the entry still belongs to `generation`
    pub fn remove_generation(&mut self, peer_id: &PeerId, generation: u64) -> Option<PeerInfo> {
        if self.get_generation(peer_id, generation).is_some() {
            self.peers.remove(peer_id)
        } else {
            None
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerInfo> {
        self.peers.get_mut(peer_id)
    }

    fn get_generation(&self, peer_id: &PeerId, generation: u64) -> Option<&PeerInfo> {
        self.peers.get(peer_id).filter(|info| info.generation == generation)
    }

    /// Mutable access that ignores late events from a replaced connection
    pub fn get_generation_mut(&mut self, peer_id: &PeerId, generation: u64) -> Option<&mut PeerInfo> {
        self.peers
            .get_mut(peer_id)
            .filter(|info| info.generation == generation)
    }

    /// Update last seen time for a peer
    pub fn touch(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.last_seen = now_ms();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
