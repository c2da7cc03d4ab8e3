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

//! Directional peer block list.
//!
//! The block list is plain data: every operation takes a slice of entries and
//! returns a new vector. The control plane owns the current list and the
//! dashboard reads copies of it.

use crate::storage::{BLOCKLIST_KEY, StateStore};
use crate::types::{PeerId, now_ms};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

/// Traffic direction a block applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockDirection {
    Inbound,
    Outbound,
    All,
}

impl BlockDirection {
    pub fn blocks_inbound(self) -> bool {
        matches!(self, BlockDirection::Inbound | BlockDirection::All)
    }

    pub fn blocks_outbound(self) -> bool {
        matches!(self, BlockDirection::Outbound | BlockDirection::All)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocklistEntry {
    pub peer_id: PeerId,
    pub direction: BlockDirection,
    #[serde(default)]
    pub reason: Option<String>,
    pub added_at: u64,
}

/// Trim ids, drop blank ones and collapse duplicate `(peer, direction)` pairs
///
/// When duplicates exist the entry with the latest `added_at` survives. The
/// result is ordered newest first, ties broken by peer id.
pub fn normalize_blocklist(entries: Vec<BlocklistEntry>) -> Vec<BlocklistEntry> {
    let mut latest: HashMap<(PeerId, BlockDirection), BlocklistEntry> = HashMap::new();

    for mut entry in entries {
        let trimmed = entry.peer_id.0.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() != entry.peer_id.0.len() {
            entry.peer_id = PeerId(trimmed.to_string());
        }
        entry.reason = entry
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let key = (entry.peer_id.clone(), entry.direction);
        match latest.get(&key) {
            Some(existing) if existing.added_at >= entry.added_at => {}
            _ => {
                latest.insert(key, entry);
            }
        }
    }

    let mut normalized: Vec<BlocklistEntry> = latest.into_values().collect();
    normalized.sort_by(|a, b| {
        b.added_at
            .cmp(&a.added_at)
            .then_with(|| a.peer_id.cmp(&b.peer_id))
            .then_with(|| direction_rank(a.direction).cmp(&direction_rank(b.direction)))
    });
    normalized
}

fn direction_rank(direction: BlockDirection) -> u8 {
    match direction {
        BlockDirection::All => 0,
        BlockDirection::Inbound => 1,
        BlockDirection::Outbound => 2,
    }
}

/// Load and normalize the stored list
///
/// Entries that fail to decode are skipped individually; an unreadable store
/// yields an empty list.
pub async fn load_blocklist_from_storage(store: &dyn StateStore) -> Vec<BlocklistEntry> {
    let raw = match store.get(BLOCKLIST_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!("Failed to read blocklist: {:#}", e);
            return Vec::new();
        }
    };

    let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
        Ok(values) => values,
        Err(e) => {
            warn!("Stored blocklist is not a list, ignoring: {}", e);
            return Vec::new();
        }
    };

    let entries = values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<BlocklistEntry>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping malformed blocklist entry: {}", e);
                None
            }
        })
        .collect();

    normalize_blocklist(entries)
}

/// Write the whole list as one value
pub async fn persist_blocklist(store: &dyn StateStore, entries: &[BlocklistEntry]) -> Result<()> {
    let raw = serde_json::to_string(entries).context("Failed to encode blocklist")?;
    store.set(BLOCKLIST_KEY, &raw).await
}

/// Peers whose inbound traffic is refused
pub fn derive_blocked_peer_ids(entries: &[BlocklistEntry]) -> HashSet<PeerId> {
    entries
        .iter()
        .filter(|e| e.direction.blocks_inbound())
        .map(|e| e.peer_id.clone())
        .collect()
}

/// Peers we refuse to dial
pub fn derive_outbound_blocked_peer_ids(entries: &[BlocklistEntry]) -> HashSet<PeerId> {
    entries
        .iter()
        .filter(|e| e.direction.blocks_outbound())
        .map(|e| e.peer_id.clone())
        .collect()
}

/// Insert or replace the entry for `(peer_id, direction)`, stamped now
pub fn upsert_blocklist_entry(
    entries: &[BlocklistEntry],
    peer_id: &PeerId,
    direction: BlockDirection,
    reason: Option<String>,
) -> Vec<BlocklistEntry> {
    upsert_blocklist_entry_at(entries, peer_id, direction, reason, now_ms())
}

/// Same as [`upsert_blocklist_entry`] with an explicit timestamp
pub fn upsert_blocklist_entry_at(
    entries: &[BlocklistEntry],
    peer_id: &PeerId,
    direction: BlockDirection,
    reason: Option<String>,
    added_at: u64,
) -> Vec<BlocklistEntry> {
    let peer_id = PeerId(peer_id.0.trim().to_string());
    let mut next: Vec<BlocklistEntry> = entries
        .iter()
        .filter(|e| !(e.peer_id == peer_id && e.direction == direction))
        .cloned()
        .collect();

    next.push(BlocklistEntry {
        peer_id,
        direction,
        reason,
        added_at,
    });

    normalize_blocklist(next)
}

/// Remove the entry for `(peer_id, direction)`, or every entry for the peer
/// when `direction` is `None`
pub fn remove_blocklist_entry(
    entries: &[BlocklistEntry],
    peer_id: &PeerId,
    direction: Option<BlockDirection>,
) -> Vec<BlocklistEntry> {
    let peer_id = peer_id.0.trim();
    entries
        .iter()
        .filter(|e| {
            let same_peer = e.peer_id.0 == peer_id;
            let same_direction = direction.is_none_or(|d| d == e.direction);
            !(same_peer && same_direction)
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn entry(peer: &str, direction: BlockDirection, added_at: u64) -> BlocklistEntry {
        BlocklistEntry {
            peer_id: PeerId::from(peer),
            direction,
            reason: None,
            added_at,
        }
    }

    #[test]
    fn test_upsert_is_idempotent_and_keeps_second_timestamp() {
        let p = PeerId::from("p1");
        let once = upsert_blocklist_entry_at(&[], &p, BlockDirection::Inbound, None, 100);
        let twice = upsert_blocklist_entry_at(&once, &p, BlockDirection::Inbound, None, 200);

        let matching: Vec<_> = twice
            .iter()
            .filter(|e| e.peer_id == p && e.direction == BlockDirection::Inbound)
            .collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].added_at, 200);
    }

    #[test]
    fn test_upsert_keeps_other_directions() {
        let p = PeerId::from("p1");
        let list = upsert_blocklist_entry_at(&[], &p, BlockDirection::Inbound, None, 1);
        let list = upsert_blocklist_entry_at(&list, &p, BlockDirection::Outbound, Some("spam".into()), 2);

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].direction, BlockDirection::Outbound);
        assert_eq!(list[0].reason.as_deref(), Some("spam"));
    }

    #[test]
    fn test_direction_derivation() {
        let entries = vec![
            entry("p1", BlockDirection::Inbound, 1),
            entry("p2", BlockDirection::Outbound, 2),
            entry("p3", BlockDirection::All, 3),
        ];

        let inbound = derive_blocked_peer_ids(&entries);
        let outbound = derive_outbound_blocked_peer_ids(&entries);

        assert_eq!(inbound, HashSet::from([PeerId::from("p1"), PeerId::from("p3")]));
        assert_eq!(outbound, HashSet::from([PeerId::from("p2"), PeerId::from("p3")]));
    }

    #[test]
    fn test_normalize_dedupes_and_trims() {
        let entries = vec![
            entry(" p1 ", BlockDirection::All, 10),
            entry("p1", BlockDirection::All, 30),
            entry("p1", BlockDirection::All, 20),
            entry("   ", BlockDirection::All, 40),
        ];

        let normalized = normalize_blocklist(entries);

        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].peer_id.as_str(), "p1");
        assert_eq!(normalized[0].added_at, 30);
    }

    #[test]
    fn test_remove_by_direction_and_all() {
        let entries = vec![
            entry("p1", BlockDirection::Inbound, 1),
            entry("p1", BlockDirection::Outbound, 2),
            entry("p2", BlockDirection::All, 3),
        ];

        let one = remove_blocklist_entry(&entries, &PeerId::from("p1"), Some(BlockDirection::Inbound));
        assert_eq!(one.len(), 2);

        let none_left = remove_blocklist_entry(&entries, &PeerId::from("p1"), None);
        assert_eq!(none_left.len(), 1);
        assert_eq!(none_left[0].peer_id.as_str(), "p2");
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = MemoryStore::new();
        let list = upsert_blocklist_entry(&[], &PeerId::from("p9"), BlockDirection::All, Some("abuse".into()));

        persist_blocklist(&store, &list).await.unwrap();
        let loaded = load_blocklist_from_storage(&store).await;

        assert_eq!(loaded, list);
    }

    #[tokio::test]
    async fn test_load_skips_malformed_entries() {
        let store = MemoryStore::new();
        store
            .set(
                BLOCKLIST_KEY,
                r#"[{"peerId":"p1","direction":"all","addedAt":5},{"peerId":"p2","direction":"sideways","addedAt":6},42]"#,
            )
            .await
            .unwrap();

        let loaded = load_blocklist_from_storage(&store).await;

        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].peer_id.as_str(), "p1");
    }

    #[tokio::test]
    async fn test_load_garbage_is_empty() {
        let store = MemoryStore::new();
        store.set(BLOCKLIST_KEY, "not json").await.unwrap();

        assert!(load_blocklist_from_storage(&store).await.is_empty());
    }
}
