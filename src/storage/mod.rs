use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use crate::types::now_ms;

/// Persisted blocklist entries
pub const BLOCKLIST_KEY: &str = "flux.p2p.blocklist";
/// Connection quality metrics keyed by peer id
pub const QUALITY_KEY: &str = "flux.p2p.connection-quality";
/// Control-plane flags
pub const CONTROL_KEY: &str = "flux.p2p.control";
/// Pending auto-resume deadlines
pub const CONTROL_RESUME_KEY: &str = "flux.p2p.control-resume";
/// Rendezvous mesh toggle ("true" / "false")
pub const RENDEZVOUS_KEY: &str = "flux.p2p.rendezvous-enabled";
/// Node peer id, generated once and reused
pub const PEER_ID_KEY: &str = "flux.p2p.peer-id";

/// Durable key/value state used by the control plane
///
/// Every component that persists state writes a single JSON value under its
/// own key. Last write wins; there is no cross-key transaction.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

/// Read and decode a JSON value
pub async fn load_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to decode stored value for {}", key))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Encode and write a JSON value
pub async fn save_json<T: Serialize + ?Sized>(store: &dyn StateStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)
        .with_context(|| format!("Failed to encode value for {}", key))?;
    store.set(key, &raw).await
}

/// SQLite-backed state store
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (or create) the database at the given path
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        let in_memory = db_path == Path::new(":memory:");

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        // Each in-memory connection is its own database
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> Result<()> {
        let schema = include_str!("schema.sql");
        sqlx::query(schema)
            .execute(&self.pool)
            .await
            .context("Failed to initialize schema")?;

        Ok(())
    }
}

#[async_trait]
impl StateStore for Storage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read {}", key))?;

        Ok(row.map(|row| row.get::<String, _>("value")))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_ms() as i64)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write {}", key))?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to delete {}", key))?;

        Ok(())
    }
}

/// Volatile state store for ephemeral nodes and tests
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, as a full disk would
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            bail!("storage quota exceeded while writing {}", key);
        }
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            bail!("storage quota exceeded while removing {}", key);
        }
        self.values.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_sqlite_round_trip_and_overwrite() {
        let storage = Storage::new(":memory:").await.unwrap();

        assert_eq!(storage.get("missing").await.unwrap(), None);

        storage.set("k", "one").await.unwrap();
        storage.set("k", "two").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().as_deref(), Some("two"));

        storage.remove("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let store = MemoryStore::new();
        let sample = Sample {
            name: "flux".to_string(),
            count: 3,
        };

        save_json(&store, "sample", &sample).await.unwrap();
        let loaded: Option<Sample> = load_json(&store, "sample").await.unwrap();
        assert_eq!(loaded, Some(sample));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_an_error() {
        let store = MemoryStore::new();
        store.set("sample", "{not json").await.unwrap();

        let loaded: Result<Option<Sample>> = load_json(&store, "sample").await;
        assert!(loaded.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_writes() {
        let store = MemoryStore::new();
        store.set_reject_writes(true);

        assert!(store.set("k", "v").await.is_err());
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
