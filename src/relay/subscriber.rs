//! # Subscriber
//!
//! Tracks topic subscriptions and persists them so they can be replayed
//! after a reconnect or a process restart. Many subscription ids may map
//! to one topic over a connection's lifetime (each successful
//! resubscribe mints a new id); the map keeps them all until the topic
//! is dropped.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::Result;
use crate::storage::{storage_key, Storage};

/// Version segment of the subscription storage key
const SUBSCRIBER_VERSION: &str = "0.3";

/// Persisted topic → subscription-ids map
pub struct Subscriber {
    storage: Storage,
    subscriptions: RwLock<HashMap<String, Vec<String>>>,
    storage_key: String,
}

impl Subscriber {
    /// Create a subscriber over a storage backend
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            subscriptions: RwLock::new(HashMap::new()),
            storage_key: storage_key("core", SUBSCRIBER_VERSION, "subscription"),
        }
    }

    /// Restore persisted subscriptions
    pub async fn init(&self) -> Result<()> {
        match self.storage.get(&self.storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<HashMap<String, Vec<String>>>(&raw) {
                Ok(map) => {
                    tracing::debug!(topics = map.len(), "Restored subscriptions");
                    *self.subscriptions.write() = map;
                }
                Err(e) => tracing::warn!("Corrupt subscription blob, starting fresh: {e}"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read subscriptions, starting fresh: {e}"),
        }
        Ok(())
    }

    /// Mark a topic as subscribing so pushes arriving while the ack is in
    /// flight are not dropped as unknown-topic traffic
    pub async fn track(&self, topic: &str) -> Result<()> {
        self.subscriptions.write().entry(topic.to_string()).or_default();
        self.persist().await
    }

    /// Record a subscription id for a topic
    pub async fn set(&self, topic: &str, id: String) -> Result<()> {
        self.subscriptions
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(id);
        self.persist().await
    }

    /// Whether a topic is subscribed
    pub fn has(&self, topic: &str) -> bool {
        self.subscriptions.read().contains_key(topic)
    }

    /// Subscription ids for a topic
    pub fn ids(&self, topic: &str) -> Vec<String> {
        self.subscriptions.read().get(topic).cloned().unwrap_or_default()
    }

    /// All subscribed topics
    pub fn topics(&self) -> Vec<String> {
        self.subscriptions.read().keys().cloned().collect()
    }

    /// Drop one subscription id, or the whole topic when `id` is `None`
    ///
    /// Returns `true` when the topic no longer has any ids (fully
    /// unsubscribed).
    pub async fn remove(&self, topic: &str, id: Option<&str>) -> Result<bool> {
        let empty = {
            let mut subscriptions = self.subscriptions.write();
            match id {
                Some(id) => {
                    if let Some(ids) = subscriptions.get_mut(topic) {
                        ids.retain(|existing| existing != id);
                        if ids.is_empty() {
                            subscriptions.remove(topic);
                        }
                    }
                }
                None => {
                    subscriptions.remove(topic);
                }
            }
            !subscriptions.contains_key(topic)
        };
        self.persist().await?;
        Ok(empty)
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let subscriptions = self.subscriptions.read();
            serde_json::to_string(&*subscriptions)?
        };
        self.storage.set(&self.storage_key, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_multiple_ids_per_topic() {
        let subscriber = Subscriber::new(Arc::new(MemoryStorage::new()));

        subscriber.set("t1", "sub-a".into()).await.unwrap();
        subscriber.set("t1", "sub-b".into()).await.unwrap();

        assert!(subscriber.has("t1"));
        assert_eq!(subscriber.ids("t1"), vec!["sub-a".to_string(), "sub-b".to_string()]);

        // Removing one id keeps the topic alive
        assert!(!subscriber.remove("t1", Some("sub-a")).await.unwrap());
        assert!(subscriber.has("t1"));

        // Removing the last id drops the topic
        assert!(subscriber.remove("t1", Some("sub-b")).await.unwrap());
        assert!(!subscriber.has("t1"));
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let storage: Storage = Arc::new(MemoryStorage::new());

        let subscriber = Subscriber::new(storage.clone());
        subscriber.set("t1", "sub-a".into()).await.unwrap();

        let restored = Subscriber::new(storage);
        restored.init().await.unwrap();
        assert_eq!(restored.topics(), vec!["t1".to_string()]);
    }
}
