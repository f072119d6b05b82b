//! Durable key-value storage backing the cache and the mutation queue.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

impl StorageError {
    fn backend(err: anyhow::Error) -> Self {
        StorageError::Backend(format!("{err:#}"))
    }
}

/// Minimal key-value contract. Values are JSON text.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-process store. Dropping the last handle loses the data; keep an `Arc`
/// alive across components to simulate a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite-backed store (one `kv_store` table).
///
/// Cheap to clone; the pool is opened lazily on first use.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    location: Location,
    pool: Arc<Mutex<Option<SqlitePool>>>,
}

impl SqliteStore {
    /// Store persisted at `path`; parent directories are created on first use.
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            location: Location::File(path.as_ref().to_path_buf()),
            pool: Arc::new(Mutex::new(None)),
        }
    }

    /// Private in-memory database (single connection).
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            pool: Arc::new(Mutex::new(None)),
        }
    }

    async fn get_pool(&self) -> Result<SqlitePool, StorageError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = self.connect().await.map_err(StorageError::backend)?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    async fn connect(&self) -> anyhow::Result<SqlitePool> {
        let (options, pool_options) = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create storage directory at {:?}", parent)
                    })?;
                }
                let options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true);
                (options, SqlitePoolOptions::new().max_connections(4))
            }
            // The database lives and dies with its single connection.
            Location::Memory => (
                SqliteConnectOptions::new().in_memory(true),
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None),
            ),
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open SQLite store at {:?}", self.location))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create kv_store table")?;

        tracing::debug!(location = ?self.location, "opened SQLite store");
        Ok(pool)
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let pool = self.get_pool().await?;
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&pool)
            .await
            .with_context(|| format!("failed to read key '{key}'"))
            .map_err(StorageError::backend)?;

        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let pool = self.get_pool().await?;
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key)
            DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .with_context(|| format!("failed to write key '{key}'"))
        .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let pool = self.get_pool().await?;
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&pool)
            .await
            .with_context(|| format!("failed to delete key '{key}'"))
            .map_err(StorageError::backend)?;
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pool = self.get_pool().await?;
        let rows = sqlx::query(
            r#"
            SELECT key
            FROM kv_store
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY key ASC
            "#,
        )
        .bind(prefix)
        .fetch_all(&pool)
        .await
        .with_context(|| format!("failed to list keys with prefix '{prefix}'"))
        .map_err(StorageError::backend)?;

        rows.into_iter()
            .map(|r| {
                r.try_get::<String, _>("key")
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn KeyValueStore) {
        store.set("cache:item:A", "1").await.unwrap();
        store.set("cache:item:B", "2").await.unwrap();
        store.set("queue:x", "3").await.unwrap();

        assert_eq!(store.get("cache:item:A").await.unwrap().as_deref(), Some("1"));
        assert_eq!(
            store.keys("cache:").await.unwrap(),
            vec!["cache:item:A".to_string(), "cache:item:B".to_string()]
        );

        store.set("cache:item:A", "10").await.unwrap();
        assert_eq!(store.get("cache:item:A").await.unwrap().as_deref(), Some("10"));

        store.delete("cache:item:A").await.unwrap();
        assert_eq!(store.get("cache:item:A").await.unwrap(), None);
        assert_eq!(store.keys("queue:").await.unwrap(), vec!["queue:x".to_string()]);
        assert!(store.keys("nothing:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        exercise(&SqliteStore::in_memory()).await;
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let path = std::env::temp_dir()
            .join(format!("stockcount-test-{}", uuid::Uuid::now_v7()))
            .join("offline.db");

        {
            let store = SqliteStore::open(&path);
            store.set("queue:a", "{\"seq\":1}").await.unwrap();
        }

        let reopened = SqliteStore::open(&path);
        assert_eq!(
            reopened.get("queue:a").await.unwrap().as_deref(),
            Some("{\"seq\":1}")
        );

        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
