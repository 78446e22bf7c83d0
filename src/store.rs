//! # Observable Record Store
//!
//! A small generic persisted store parameterized over the record type,
//! exposing get/set/delete/get_all plus a typed event channel. Every
//! higher-level store (pairings, proposals, sessions, pending requests)
//! is an instance of this; none of them share mutable state — all
//! cross-component access goes through the owning store's accessors.
//!
//! The full record list is persisted as one JSON blob under a
//! deterministic prefixed key and rehydrated on init. A corrupt blob is
//! logged and treated as an empty store.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::storage::{storage_key, Storage};

/// A record that knows its own store key
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The key this record is stored under (topic or stringified id)
    fn key(&self) -> String;
}

/// Typed store change notification
#[derive(Debug, Clone)]
pub enum StoreEvent<V> {
    /// A record was inserted for the first time
    Created(V),
    /// An existing record was overwritten
    Updated(V),
    /// A record was removed
    Deleted(V),
}

/// Generic persisted map of records with change events
pub struct Store<V: Record> {
    name: String,
    storage: Storage,
    storage_key: String,
    records: RwLock<HashMap<String, V>>,
    events: broadcast::Sender<StoreEvent<V>>,
}

impl<V: Record> Store<V> {
    /// Create a store persisting under `wc@2:<context>:<version>//<name>`
    pub fn new(storage: Storage, context: &str, version: &str, name: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            name: name.to_string(),
            storage,
            storage_key: storage_key(context, version, name),
            records: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Restore persisted records
    pub async fn init(&self) -> Result<()> {
        match self.storage.get(&self.storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<V>>(&raw) {
                Ok(list) => {
                    tracing::debug!(store = %self.name, count = list.len(), "Restored records");
                    let mut records = self.records.write();
                    for record in list {
                        records.insert(record.key(), record);
                    }
                }
                Err(e) => {
                    tracing::warn!(store = %self.name, "Corrupt store blob, starting fresh: {e}");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(store = %self.name, "Failed to read store, starting fresh: {e}");
            }
        }
        Ok(())
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent<V>> {
        self.events.subscribe()
    }

    /// Insert or overwrite a record
    pub async fn set(&self, record: V) -> Result<()> {
        let key = record.key();
        let previous = self.records.write().insert(key, record.clone());
        self.persist().await?;
        let event = match previous {
            Some(_) => StoreEvent::Updated(record),
            None => StoreEvent::Created(record),
        };
        let _ = self.events.send(event);
        Ok(())
    }

    /// Fetch a record by key
    pub fn get(&self, key: &str) -> Result<V> {
        self.records
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}: {key}", self.name)))
    }

    /// Whether a record exists
    pub fn contains(&self, key: &str) -> bool {
        self.records.read().contains_key(key)
    }

    /// All records (unordered)
    pub fn get_all(&self) -> Vec<V> {
        self.records.read().values().cloned().collect()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Delete a record by key; no-op (Ok) if absent
    pub async fn delete(&self, key: &str) -> Result<()> {
        let removed = self.records.write().remove(key);
        if let Some(record) = removed {
            self.persist().await?;
            let _ = self.events.send(StoreEvent::Deleted(record));
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let records = self.records.read();
            serde_json::to_string(&records.values().collect::<Vec<_>>())?
        };
        self.storage.set(&self.storage_key, &snapshot).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::Deserialize;

    use super::*;
    use crate::storage::MemoryStorage;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestRecord {
        topic: String,
        value: u32,
    }

    impl Record for TestRecord {
        fn key(&self) -> String {
            self.topic.clone()
        }
    }

    #[tokio::test]
    async fn test_set_get_delete_with_events() {
        let store: Store<TestRecord> =
            Store::new(Arc::new(MemoryStorage::new()), "client", "1", "test");
        let mut events = store.subscribe();

        let record = TestRecord { topic: "t1".into(), value: 1 };
        store.set(record.clone()).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::Created(r) if r == record));

        let updated = TestRecord { topic: "t1".into(), value: 2 };
        store.set(updated.clone()).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::Updated(r) if r.value == 2));

        assert_eq!(store.get("t1").unwrap().value, 2);

        store.delete("t1").await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), StoreEvent::Deleted(_)));
        assert!(store.get("t1").is_err());

        // Deleting again is a no-op, not an error
        store.delete("t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_rehydrates_from_storage() {
        let storage: Storage = Arc::new(MemoryStorage::new());

        let store: Store<TestRecord> = Store::new(storage.clone(), "client", "1", "test");
        store.set(TestRecord { topic: "t1".into(), value: 7 }).await.unwrap();

        let restored: Store<TestRecord> = Store::new(storage, "client", "1", "test");
        restored.init().await.unwrap();
        assert_eq!(restored.get("t1").unwrap().value, 7);
    }

    #[tokio::test]
    async fn test_corrupt_blob_starts_empty() {
        let storage: Storage = Arc::new(MemoryStorage::new());
        storage.set(&storage_key("client", "1", "test"), "[{bad").await.unwrap();

        let store: Store<TestRecord> = Store::new(storage, "client", "1", "test");
        store.init().await.unwrap();
        assert!(store.is_empty());
    }
}
