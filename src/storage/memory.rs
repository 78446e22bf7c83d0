//! In-memory storage backend.
//!
//! Used by tests and by ephemeral clients that do not want state to
//! survive a restart. Backed by a `HashMap` behind a `parking_lot`
//! read-write lock.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::KeyValueStorage;
use crate::error::Result;

/// Ephemeral key-value store
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}
