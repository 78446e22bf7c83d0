//! # Storage Module
//!
//! Persisted client state behind an abstract async key-value store.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  KeyValueStorage trait                                                 │
//! │  ─────────────────────                                                  │
//! │  • get(key)        - Read a JSON string                                │
//! │  • set(key, value) - Write a JSON string                               │
//! │  • remove(key)     - Delete a key                                      │
//! │  • keys()          - List all keys                                     │
//! │                                                                         │
//! │  Backends:                                                             │
//! │  ┌───────────────────────┐   ┌───────────────────────┐                │
//! │  │  MemoryStorage        │   │  SqliteStorage        │                │
//! │  │  (tests, ephemeral)   │   │  (durable, bundled)   │                │
//! │  └───────────────────────┘   └───────────────────────┘                │
//! │                                                                         │
//! │  Every store persists under a deterministic prefixed key               │
//! │  (`wc@2:core:1//keychain`-style) so a process restart can rehydrate    │
//! │  pairings and sessions without a fresh handshake.                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Protocol storage version, part of every storage key.
pub const STORAGE_VERSION: &str = "wc@2";

/// Abstract async key-value store
///
/// All records are persisted as JSON strings under deterministic prefixed
/// keys. Implementations must be safe to call from multiple tasks.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Read the value stored under `key`, if any
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, overwriting any previous value
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete the value stored under `key` (no-op if absent)
    async fn remove(&self, key: &str) -> Result<()>;

    /// List every key currently in the store
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Shared handle to a storage backend
pub type Storage = Arc<dyn KeyValueStorage>;

/// Build the deterministic storage key for a named store.
///
/// Format: `wc@2:<context>:<version>//<name>`, e.g. `wc@2:core:1//keychain`.
pub fn storage_key(context: &str, version: &str, name: &str) -> String {
    format!("{STORAGE_VERSION}:{context}:{version}//{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_format() {
        assert_eq!(storage_key("core", "1", "keychain"), "wc@2:core:1//keychain");
        assert_eq!(storage_key("client", "1", "session"), "wc@2:client:1//session");
    }

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        storage.set("a", "1").await.unwrap();
        storage.set("b", "2").await.unwrap();

        assert_eq!(storage.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(storage.get("missing").await.unwrap(), None);

        let mut keys = storage.keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);

        storage.remove("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
    }
}
