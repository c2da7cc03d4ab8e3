use crate::signaling::{AnnouncePayload, PeerProfile};
use crate::types::{ManifestHash, PeerId, UserId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// A peer learned through announcements, connected or not
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredPeer {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub profile: PeerProfile,
    pub last_seen: u64,
    pub available_content: BTreeSet<ManifestHash>,
    pub health_status: Option<String>,
}

impl DiscoveredPeer {
    pub fn is_online(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.last_seen) <= ttl_ms
    }
}

/// Peers keyed by id; entries are refreshed, never deleted
#[derive(Debug, Default)]
pub struct DiscoveryTable {
    peers: HashMap<PeerId, DiscoveredPeer>,
}

impl DiscoveryTable {
    /// Merge an announcement. Returns true when the peer was new.
    pub fn apply_announce(&mut self, peer_id: &PeerId, user_id: &UserId, payload: AnnouncePayload, now: u64) -> bool {
        let is_new = !self.peers.contains_key(peer_id);
        let entry = self.entry(peer_id, user_id, now);
        entry.user_id = user_id.clone();
        entry.profile = payload.profile;
        entry.available_content = payload.available_content.into_iter().collect();
        entry.health_status = payload.health_status;
        entry.last_seen = now;
        is_new
    }

    /// Add advertised hashes to what we know the peer holds
    pub fn apply_available(&mut self, peer_id: &PeerId, user_id: &UserId, hashes: Vec<ManifestHash>, now: u64) {
        let entry = self.entry(peer_id, user_id, now);
        entry.available_content.extend(hashes);
        entry.last_seen = now;
    }

    /// Replace the peer's content set with a full listing
    pub fn replace_content(&mut self, peer_id: &PeerId, hashes: &[ManifestHash]) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.available_content = hashes.iter().cloned().collect();
        }
    }

    pub fn touch(&mut self, peer_id: &PeerId, now: u64) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.last_seen = now;
        }
    }

    pub fn mark_departed(&mut self, peer_id: &PeerId) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.health_status = Some("offline".to_string());
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&DiscoveredPeer> {
        self.peers.get(peer_id)
    }

    /// Most recently seen first
    pub fn list(&self) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.peer_id.cmp(&b.peer_id)));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn entry(&mut self, peer_id: &PeerId, user_id: &UserId, now: u64) -> &mut DiscoveredPeer {
        self.peers
            .entry(peer_id.clone())
            .or_insert_with(|| DiscoveredPeer {
                peer_id: peer_id.clone(),
                user_id: user_id.clone(),
                profile: PeerProfile::default(),
                last_seen: now,
                available_content: BTreeSet::new(),
                health_status: None,
            })
    }
}

/// Only the lower peer id dials during auto-connect, so two nodes never
/// offer to each other at the same time
pub fn should_initiate(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}
