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

use crate::storage::{PEER_ID_KEY, StateStore};
use crate::types::{PeerId, UserId};
use anyhow::{Context, Result};

/// Identity of the local node: the account it runs for and its peer id
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    peer_id: PeerId,
    user_id: UserId,
}

impl NodeIdentity {
    pub fn new(peer_id: PeerId, user_id: UserId) -> Self {
        Self { peer_id, user_id }
    }

    /// Reuse the stored peer id, or generate and store a new one
    pub async fn load_or_generate(store: &dyn StateStore, user_id: UserId) -> Result<Self> {
        let stored = store
            .get(PEER_ID_KEY)
            .await
            .context("Failed to read stored peer id")?
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty());

        let peer_id = match stored {
            Some(raw) => {
                tracing::info!("Reusing peer id {}", raw);
                PeerId(raw)
            }
            None => {
                let peer_id = PeerId::generate();
                tracing::info!("Generated new peer id {}", peer_id);
                store
                    .set(PEER_ID_KEY, peer_id.as_str())
                    .await
                    .context("Failed to store peer id")?;
                peer_id
            }
        };

        Ok(Self { peer_id, user_id })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_peer_id_is_reused() {
        let store = MemoryStore::new();

        let first = NodeIdentity::load_or_generate(&store, UserId::from("alice"))
            .await
            .unwrap();
        let second = NodeIdentity::load_or_generate(&store, UserId::from("alice"))
            .await
            .unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(second.user_id().as_str(), "alice");
    }

    #[tokio::test]
    async fn test_blank_stored_id_is_replaced() {
        let store = MemoryStore::new();
        store.set(PEER_ID_KEY, "   ").await.unwrap();

        let identity = NodeIdentity::load_or_generate(&store, UserId::from("bob"))
            .await
            .unwrap();

        assert!(identity.peer_id().as_str().starts_with("peer-"));
    }
}
