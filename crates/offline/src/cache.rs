//! Read-through local cache with staleness tracking.
//!
//! Every successful network read is written here before it is returned; every
//! cache read answers immediately. Staleness is reported, never enforced: an
//! old value is still better than nothing when the server is out of reach.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::queue::{MutationKind, QueuedMutation};
use crate::storage::{KeyValueStore, StorageError};
use crate::types::DataSource;

const PREFIX: &str = "cache:";

/// A cached payload and when it was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub payload: T,
    pub cached_at: DateTime<Utc>,
    pub source: DataSource,
}

/// A cache hit plus its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<T> {
    pub entry: CacheEntry<T>,
    pub stale: bool,
}

/// Persistent cache over a [`KeyValueStore`].
pub struct LocalCache {
    store: Arc<dyn KeyValueStore>,
    stale_threshold: chrono::Duration,
    // Serializes read-modify-write so `cached_at` never moves backward.
    write_lock: Mutex<()>,
}

impl LocalCache {
    pub fn new(store: Arc<dyn KeyValueStore>, stale_threshold: Duration) -> Self {
        Self {
            store,
            stale_threshold: chrono::Duration::from_std(stale_threshold)
                .unwrap_or(chrono::Duration::MAX),
            write_lock: Mutex::new(()),
        }
    }

    fn storage_key(key: &str) -> String {
        format!("{PREFIX}{key}")
    }

    pub fn is_stale(&self, cached_at: DateTime<Utc>) -> bool {
        self.is_stale_at(cached_at, Utc::now())
    }

    pub fn is_stale_at(&self, cached_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(cached_at) > self.stale_threshold
    }

    /// Raw entry lookup.
    pub async fn entry(&self, key: &str) -> Result<Option<CacheEntry<Value>>, StorageError> {
        let storage_key = Self::storage_key(key);
        let Some(raw) = self.store.get(&storage_key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: storage_key,
                reason: e.to_string(),
            })
    }

    /// Typed lookup with staleness flag.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<CacheHit<T>>, StorageError> {
        let Some(entry) = self.entry(key).await? else {
            return Ok(None);
        };

        let payload: T =
            serde_json::from_value(entry.payload).map_err(|e| StorageError::Corrupt {
                key: Self::storage_key(key),
                reason: e.to_string(),
            })?;

        let stale = self.is_stale(entry.cached_at);
        if stale {
            tracing::debug!(key, cached_at = %entry.cached_at, "serving stale cache entry");
        }

        Ok(Some(CacheHit {
            entry: CacheEntry {
                key: entry.key,
                payload,
                cached_at: entry.cached_at,
                source: entry.source,
            },
            stale,
        }))
    }

    /// Store a freshly read server value.
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        payload: &T,
    ) -> Result<CacheEntry<Value>, StorageError> {
        self.put_with_source(key, payload, DataSource::Api).await
    }

    pub async fn put_with_source<T: Serialize>(
        &self,
        key: &str,
        payload: &T,
        source: DataSource,
    ) -> Result<CacheEntry<Value>, StorageError> {
        let payload = to_value(key, payload)?;
        let _guard = self.write_lock.lock().await;

        let mut cached_at = Utc::now();
        if let Some(previous) = self.entry(key).await? {
            cached_at = cached_at.max(previous.cached_at);
        }

        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            cached_at,
            source,
        };
        self.write(&entry).await?;
        Ok(entry)
    }

    /// Write an entry with its own timestamp. Ignored (returns `false`) when the
    /// stored entry is newer.
    pub async fn put_entry(&self, entry: CacheEntry<Value>) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        if let Some(previous) = self.entry(&entry.key).await? {
            if previous.cached_at > entry.cached_at {
                tracing::debug!(key = %entry.key, "ignoring cache write older than stored entry");
                return Ok(false);
            }
        }
        self.write(&entry).await?;
        Ok(true)
    }

    /// Shallow-merge `fields` into the cached object (server-assigned fields
    /// after a replayed create). Creates the entry if absent.
    pub async fn merge(
        &self,
        key: &str,
        fields: &Value,
        source: DataSource,
    ) -> Result<CacheEntry<Value>, StorageError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.entry(key).await?;

        let mut cached_at = Utc::now();
        let payload = match previous {
            Some(prev) => {
                cached_at = cached_at.max(prev.cached_at);
                merge_objects(prev.payload, fields)
            }
            None => fields.clone(),
        };

        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            cached_at,
            source,
        };
        self.write(&entry).await?;
        Ok(entry)
    }

    /// Like [`merge`](Self::merge), but never creates an entry: a key that
    /// was not cached stays uncached and `None` is returned.
    pub async fn merge_existing(
        &self,
        key: &str,
        fields: &Value,
        source: DataSource,
    ) -> Result<Option<CacheEntry<Value>>, StorageError> {
        let _guard = self.write_lock.lock().await;
        let Some(previous) = self.entry(key).await? else {
            return Ok(None);
        };

        let entry = CacheEntry {
            key: key.to_string(),
            payload: merge_objects(previous.payload, fields),
            cached_at: Utc::now().max(previous.cached_at),
            source,
        };
        self.write(&entry).await?;
        Ok(Some(entry))
    }

    /// Insert `item` into a cached list, replacing the element with the same
    /// `id`. A local write may start a new list; a server-confirmed element
    /// only updates a list that already exists and never upgrades the list's
    /// own source.
    pub async fn upsert_in_list(
        &self,
        key: &str,
        item: &Value,
        source: DataSource,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let previous = self.entry(key).await?;

        let (mut items, cached_at, source) = match previous {
            Some(prev) => {
                let items = match prev.payload {
                    Value::Array(items) => items,
                    _ => Vec::new(),
                };
                let source = if source == DataSource::Api { prev.source } else { source };
                (items, Utc::now().max(prev.cached_at), source)
            }
            None if source == DataSource::Local => (Vec::new(), Utc::now(), source),
            None => return Ok(()),
        };

        let id = item.get("id");
        match items.iter_mut().find(|existing| existing.get("id") == id) {
            Some(slot) => *slot = item.clone(),
            None => items.push(item.clone()),
        }

        self.write(&CacheEntry {
            key: key.to_string(),
            payload: Value::Array(items),
            cached_at,
            source,
        })
        .await
    }

    /// Remove the element with the given `id` from a cached list. Returns
    /// whether anything was removed.
    pub async fn remove_from_list(&self, key: &str, id: &Value) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let Some(previous) = self.entry(key).await? else {
            return Ok(false);
        };
        let Value::Array(mut items) = previous.payload else {
            return Ok(false);
        };

        let before = items.len();
        items.retain(|existing| existing.get("id") != Some(id));
        if items.len() == before {
            return Ok(false);
        }

        self.write(&CacheEntry {
            key: key.to_string(),
            payload: Value::Array(items),
            cached_at: Utc::now().max(previous.cached_at),
            source: previous.source,
        })
        .await?;
        Ok(true)
    }

    /// Drop one entry (e.g. the server answered 404 for it).
    pub async fn invalidate(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        tracing::debug!(key, "invalidating cache entry");
        self.store.delete(&Self::storage_key(key)).await
    }

    /// Drop every entry.
    pub async fn clear(&self) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;
        let keys = self.store.keys(PREFIX).await?;
        for key in &keys {
            self.store.delete(key).await?;
        }
        tracing::info!(entries = keys.len(), "cleared local cache");
        Ok(keys.len())
    }

    async fn write(&self, entry: &CacheEntry<Value>) -> Result<(), StorageError> {
        let storage_key = Self::storage_key(&entry.key);
        let raw = serde_json::to_string(entry).map_err(|e| StorageError::Corrupt {
            key: storage_key.clone(),
            reason: e.to_string(),
        })?;
        self.store.set(&storage_key, &raw).await
    }
}

/// What a queued write does to cached data over its lifetime.
impl LocalCache {
    /// Provisional copy of a queued write, so reads reflect it before sync.
    pub async fn apply_provisional(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        let Some(key) = mutation.cache_key() else {
            return Ok(());
        };
        match mutation.kind {
            MutationKind::CloseSession => {
                let fields = json!({
                    "status": "closed",
                    "closed_at": mutation.payload.get("closed_at"),
                });
                // An uncached session is not invented from a close; the queued
                // close is the record.
                self.merge_existing(&key, &fields, DataSource::Local).await?;
            }
            MutationKind::Session | MutationKind::CountLine | MutationKind::UnknownItem => {
                self.put_with_source(&key, &mutation.payload, DataSource::Local)
                    .await?;
            }
        }
        if let Some(list_key) = mutation.list_key() {
            self.upsert_in_list(&list_key, &mutation.payload, DataSource::Local)
                .await?;
        }
        Ok(())
    }

    /// Fold the server's answer to an accepted write into the cache. Returns
    /// the updated record, if one is cached.
    pub async fn apply_accepted(
        &self,
        mutation: &QueuedMutation,
        response: &Value,
    ) -> Result<Option<CacheEntry<Value>>, StorageError> {
        let Some(key) = mutation.cache_key() else {
            return Ok(None);
        };
        let entry = match mutation.kind {
            MutationKind::CloseSession => {
                let mut fields = match response {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                fields
                    .entry("status")
                    .or_insert_with(|| json!("closed"));
                fields
                    .entry("closed_at")
                    .or_insert_with(|| mutation.payload.get("closed_at").cloned().unwrap_or(Value::Null));
                self.merge_existing(&key, &Value::Object(fields), DataSource::Api)
                    .await?
            }
            MutationKind::Session | MutationKind::CountLine | MutationKind::UnknownItem => {
                let fields = if response.is_object() {
                    response
                } else {
                    &mutation.payload
                };
                Some(self.merge(&key, fields, DataSource::Api).await?)
            }
        };

        if let (Some(entry), Some(list_key)) = (&entry, mutation.list_key()) {
            self.upsert_in_list(&list_key, &entry.payload, DataSource::Api)
                .await?;
        }
        Ok(entry)
    }

    /// Undo the provisional copy of a write the server refused, so refused
    /// data never reads as saved.
    pub async fn discard_provisional(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        if let Some(key) = mutation.cache_key() {
            let local = self
                .entry(&key)
                .await?
                .is_some_and(|entry| entry.source == DataSource::Local);
            if local {
                self.invalidate(&key).await?;
            }
        }
        if let (Some(list_key), Some(id)) = (mutation.list_key(), mutation.payload.get("id")) {
            self.remove_from_list(&list_key, id).await?;
        }
        Ok(())
    }

    /// The server no longer knows the write's target: drop every copy of it.
    pub async fn forget_target(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        let keys = mutation
            .entity
            .iter()
            .cloned()
            .chain(mutation.cache_key())
            .chain(mutation.list_key());
        for key in keys {
            self.invalidate(&key).await?;
        }
        Ok(())
    }
}

fn to_value<T: Serialize>(key: &str, payload: &T) -> Result<Value, StorageError> {
    serde_json::to_value(payload).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        reason: format!("failed to serialize payload: {e}"),
    })
}

fn merge_objects(base: Value, fields: &Value) -> Value {
    match (base, fields) {
        (Value::Object(mut base), Value::Object(fields)) => {
            for (k, v) in fields {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        (_, fields) => fields.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn cache() -> LocalCache {
        LocalCache::new(Arc::new(MemoryStore::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = cache();
        assert!(cache.get::<Value>("item:X1").await.unwrap().is_none());

        cache.put("item:X1", &json!({"name": "Widget"})).await.unwrap();
        let hit = cache.get::<Value>("item:X1").await.unwrap().unwrap();
        assert_eq!(hit.entry.payload["name"], "Widget");
        assert_eq!(hit.entry.source, DataSource::Api);
        assert!(!hit.stale);
    }

    #[tokio::test]
    async fn old_entries_are_served_but_flagged_stale() {
        let cache = cache();
        let old = CacheEntry {
            key: "item:X1".to_string(),
            payload: json!({"name": "Widget"}),
            cached_at: Utc::now() - chrono::Duration::seconds(120),
            source: DataSource::Api,
        };
        assert!(cache.put_entry(old).await.unwrap());

        let hit = cache.get::<Value>("item:X1").await.unwrap().unwrap();
        assert!(hit.stale);
        assert_eq!(hit.entry.payload["name"], "Widget");
    }

    #[test]
    fn staleness_boundary() {
        let cache = cache();
        let now = Utc::now();
        assert!(!cache.is_stale_at(now - chrono::Duration::seconds(60), now));
        assert!(cache.is_stale_at(now - chrono::Duration::seconds(61), now));
    }

    #[tokio::test]
    async fn cached_at_never_moves_backward() {
        let cache = cache();
        let future = Utc::now() + chrono::Duration::seconds(30);
        cache
            .put_entry(CacheEntry {
                key: "session:1".to_string(),
                payload: json!({"v": 2}),
                cached_at: future,
                source: DataSource::Api,
            })
            .await
            .unwrap();

        let older = CacheEntry {
            key: "session:1".to_string(),
            payload: json!({"v": 1}),
            cached_at: future - chrono::Duration::seconds(10),
            source: DataSource::Api,
        };
        assert!(!cache.put_entry(older).await.unwrap());

        let entry = cache.put("session:1", &json!({"v": 3})).await.unwrap();
        assert_eq!(entry.cached_at, future);
        assert_eq!(cache.entry("session:1").await.unwrap().unwrap().payload["v"], 3);
    }

    #[tokio::test]
    async fn merge_overlays_server_fields() {
        let cache = cache();
        cache
            .put_with_source(
                "count_line:1",
                &json!({"item_code": "X1", "counted_qty": 5}),
                DataSource::Local,
            )
            .await
            .unwrap();

        let merged = cache
            .merge("count_line:1", &json!({"server_id": 991}), DataSource::Api)
            .await
            .unwrap();
        assert_eq!(merged.payload["item_code"], "X1");
        assert_eq!(merged.payload["server_id"], 991);
        assert_eq!(merged.source, DataSource::Api);
    }

    #[tokio::test]
    async fn merge_existing_never_creates_entries() {
        let cache = cache();
        let fields = json!({"status": "closed"});
        assert!(cache
            .merge_existing("session:1", &fields, DataSource::Local)
            .await
            .unwrap()
            .is_none());
        assert!(cache.entry("session:1").await.unwrap().is_none());

        cache
            .put("session:1", &json!({"id": "1", "status": "open"}))
            .await
            .unwrap();
        let entry = cache
            .merge_existing("session:1", &fields, DataSource::Local)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.payload, json!({"id": "1", "status": "closed"}));
    }

    #[tokio::test]
    async fn list_elements_are_replaced_by_id() {
        let cache = cache();
        let key = "session_lines:1";

        // Confirmed elements do not start a list.
        cache
            .upsert_in_list(key, &json!({"id": "a"}), DataSource::Api)
            .await
            .unwrap();
        assert!(cache.entry(key).await.unwrap().is_none());

        cache
            .upsert_in_list(key, &json!({"id": "a", "qty": 1}), DataSource::Local)
            .await
            .unwrap();
        cache
            .upsert_in_list(key, &json!({"id": "b", "qty": 2}), DataSource::Local)
            .await
            .unwrap();
        cache
            .upsert_in_list(key, &json!({"id": "a", "qty": 1, "server_id": 7}), DataSource::Api)
            .await
            .unwrap();

        let entry = cache.entry(key).await.unwrap().unwrap();
        assert_eq!(entry.source, DataSource::Local);
        assert_eq!(
            entry.payload,
            json!([{"id": "a", "qty": 1, "server_id": 7}, {"id": "b", "qty": 2}])
        );

        assert!(cache.remove_from_list(key, &json!("a")).await.unwrap());
        assert!(!cache.remove_from_list(key, &json!("a")).await.unwrap());
        assert_eq!(cache.entry(key).await.unwrap().unwrap().payload, json!([{"id": "b", "qty": 2}]));
    }

    #[tokio::test]
    async fn invalidate_and_clear() {
        let cache = cache();
        cache.put("item:A", &json!(1)).await.unwrap();
        cache.put("item:B", &json!(2)).await.unwrap();

        cache.invalidate("item:A").await.unwrap();
        assert!(cache.entry("item:A").await.unwrap().is_none());

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.entry("item:B").await.unwrap().is_none());
    }
}
