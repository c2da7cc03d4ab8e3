use crate::types::ManifestHash;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Chunk storage the node serves `request_chunk` from
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_chunk(&self, hash: &ManifestHash) -> Option<Vec<u8>>;

    async fn put_chunk(&self, hash: ManifestHash, data: Vec<u8>);

    async fn has_chunk(&self, hash: &ManifestHash) -> bool {
        self.get_chunk(hash).await.is_some()
    }

    /// Every hash currently held
    async fn hashes(&self) -> Vec<ManifestHash>;
}

#[derive(Default)]
pub struct MemoryContentStore {
    chunks: RwLock<HashMap<ManifestHash, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn get_chunk(&self, hash: &ManifestHash) -> Option<Vec<u8>> {
        self.chunks.read().await.get(hash).cloned()
    }

    async fn put_chunk(&self, hash: ManifestHash, data: Vec<u8>) {
        self.chunks.write().await.insert(hash, data);
    }

    async fn has_chunk(&self, hash: &ManifestHash) -> bool {
        self.chunks.read().await.contains_key(hash)
    }

    async fn hashes(&self) -> Vec<ManifestHash> {
        let mut hashes: Vec<ManifestHash> = self.chunks.read().await.keys().cloned().collect();
        hashes.sort();
        hashes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryContentStore::new();
        let hash = ManifestHash::from("abc");

        assert!(!store.has_chunk(&hash).await);
        store.put_chunk(hash.clone(), b"chunk".to_vec()).await;

        assert_eq!(store.get_chunk(&hash).await, Some(b"chunk".to_vec()));
        assert_eq!(store.hashes().await, vec![hash]);
    }
}
