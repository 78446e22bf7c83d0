//! # Keychain
//!
//! Persists keypairs and derived symmetric keys under opaque string
//! labels. Keypairs are keyed by their public key hex; symmetric keys are
//! keyed by the topic they serve.
//!
//! The whole keychain is one JSON map persisted under a single storage
//! key, mirrored in memory behind a read-write lock. Restore failures are
//! logged and treated as an empty keychain — a corrupt cache must never
//! prevent the client from starting fresh.

use std::collections::HashMap;

use parking_lot::RwLock;
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::storage::{storage_key, Storage};

/// Version segment of the keychain storage key
const KEYCHAIN_VERSION: &str = "1";

/// Label → hex-encoded key material
pub struct KeyStore {
    storage: Storage,
    keychain: RwLock<HashMap<String, String>>,
    storage_key: String,
}

impl KeyStore {
    /// Create a keychain on top of a storage backend
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            keychain: RwLock::new(HashMap::new()),
            storage_key: storage_key("core", KEYCHAIN_VERSION, "keychain"),
        }
    }

    /// Restore persisted keys from storage
    pub async fn init(&self) -> Result<()> {
        match self.storage.get(&self.storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<HashMap<String, String>>(&raw) {
                Ok(entries) => {
                    tracing::debug!(count = entries.len(), "Restored keychain");
                    *self.keychain.write() = entries;
                }
                Err(e) => {
                    tracing::warn!("Corrupt keychain blob, starting fresh: {e}");
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Failed to read keychain, starting fresh: {e}");
            }
        }
        Ok(())
    }

    /// Store key material under a label
    pub async fn set(&self, label: &str, key_hex: &str) -> Result<()> {
        self.keychain.write().insert(label.to_string(), key_hex.to_string());
        self.persist().await
    }

    /// Fetch key material by label
    pub fn get(&self, label: &str) -> Result<String> {
        self.keychain
            .read()
            .get(label)
            .cloned()
            .ok_or_else(|| Error::MissingKey(label.to_string()))
    }

    /// Whether a label exists
    pub fn has(&self, label: &str) -> bool {
        self.keychain.read().contains_key(label)
    }

    /// Delete a label (no-op if absent)
    pub async fn del(&self, label: &str) -> Result<()> {
        if let Some(mut removed) = self.keychain.write().remove(label) {
            removed.zeroize();
        }
        self.persist().await
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let keychain = self.keychain.read();
            serde_json::to_string(&*keychain)?
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
    async fn test_set_get_del() {
        let keystore = KeyStore::new(Arc::new(MemoryStorage::new()));

        keystore.set("label", "aabbcc").await.unwrap();
        assert!(keystore.has("label"));
        assert_eq!(keystore.get("label").unwrap(), "aabbcc");

        keystore.del("label").await.unwrap();
        assert!(!keystore.has("label"));
        assert!(matches!(keystore.get("label"), Err(Error::MissingKey(_))));
    }

    #[tokio::test]
    async fn test_restore_from_storage() {
        let storage: Storage = Arc::new(MemoryStorage::new());

        let keystore = KeyStore::new(storage.clone());
        keystore.set("topic1", "00ff").await.unwrap();

        // New keystore over the same backend sees the persisted key
        let restored = KeyStore::new(storage);
        restored.init().await.unwrap();
        assert_eq!(restored.get("topic1").unwrap(), "00ff");
    }

    #[tokio::test]
    async fn test_corrupt_blob_starts_fresh() {
        let storage: Storage = Arc::new(MemoryStorage::new());
        storage
            .set(&storage_key("core", KEYCHAIN_VERSION, "keychain"), "{not json")
            .await
            .unwrap();

        let keystore = KeyStore::new(storage);
        keystore.init().await.unwrap();
        assert!(!keystore.has("anything"));
    }
}
