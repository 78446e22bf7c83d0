//! # Expirer
//!
//! Process-wide registry of (target → expiry timestamp) pairs with a
//! periodic sweep.
//!
//! ## Decoupled Expiry
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          EXPIRY SWEEP                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  heartbeat pulse (every Nth ≈ 30s)                                     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  for each (target, expiry):  expiry <= now ?                           │
//! │        │ yes                                                            │
//! │        ▼                                                                │
//! │  delete entry + broadcast Expired{target}                               │
//! │        │                                                                │
//! │        ├──► pairing store   ("topic:<t>")  → delete pairing + symkey   │
//! │        ├──► session store   ("topic:<t>")  → delete session + event    │
//! │        ├──► proposal store  ("id:<n>")     → delete proposal + event   │
//! │        └──► pending store   ("id:<n>")     → reject waiting caller     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One sweep mechanism serves all four record kinds: owners subscribe to
//! the event channel and parse the target prefix to decide whether it is
//! theirs. Every record has at most one live entry.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::storage::{storage_key, Storage};
use crate::time::now_timestamp;

/// Version segment of the expirer storage key
const EXPIRER_VERSION: &str = "0.3";

/// What an expiration entry points at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// A topic-owned record (pairing or session)
    Topic(String),
    /// An id-owned record (proposal or pending request)
    Id(u64),
}

impl Target {
    /// Render as the persisted `topic:<t>` / `id:<n>` string
    pub fn to_key(&self) -> String {
        match self {
            Target::Topic(topic) => format!("topic:{topic}"),
            Target::Id(id) => format!("id:{id}"),
        }
    }

    /// Parse a persisted target string
    pub fn parse(key: &str) -> Result<Self> {
        if let Some(topic) = key.strip_prefix("topic:") {
            return Ok(Target::Topic(topic.to_string()));
        }
        if let Some(id) = key.strip_prefix("id:") {
            let id = id
                .parse::<u64>()
                .map_err(|_| Error::Internal(format!("Invalid expirer target id: {key}")))?;
            return Ok(Target::Id(id));
        }
        Err(Error::Internal(format!("Unknown expirer target: {key}")))
    }
}

/// A persisted expiration entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expiration {
    /// Target key string (`topic:<t>` or `id:<n>`)
    pub target: String,
    /// Unix seconds after which the target is dead
    pub expiry: u64,
}

/// Event emitted by the sweep
#[derive(Debug, Clone)]
pub struct ExpiredEvent {
    /// The target whose expiry has passed
    pub target: Target,
    /// The expiry timestamp that passed
    pub expiry: u64,
}

/// TTL registry with heartbeat-driven sweep
pub struct Expirer {
    storage: Storage,
    entries: RwLock<HashMap<String, u64>>,
    events: broadcast::Sender<ExpiredEvent>,
    storage_key: String,
}

impl Expirer {
    /// Create an expirer over a storage backend
    pub fn new(storage: Storage) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            storage,
            entries: RwLock::new(HashMap::new()),
            events,
            storage_key: storage_key("core", EXPIRER_VERSION, "expirer"),
        }
    }

    /// Restore persisted entries
    pub async fn init(&self) -> Result<()> {
        match self.storage.get(&self.storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Expiration>>(&raw) {
                Ok(list) => {
                    let mut entries = self.entries.write();
                    for entry in list {
                        entries.insert(entry.target, entry.expiry);
                    }
                }
                Err(e) => tracing::warn!("Corrupt expirer blob, starting fresh: {e}"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read expirer, starting fresh: {e}"),
        }
        Ok(())
    }

    /// Subscribe to expiry events
    pub fn subscribe(&self) -> broadcast::Receiver<ExpiredEvent> {
        self.events.subscribe()
    }

    /// Set (or refresh) the expiry for a target
    pub async fn set(&self, target: Target, expiry: u64) -> Result<()> {
        self.entries.write().insert(target.to_key(), expiry);
        self.persist().await
    }

    /// Get the expiry for a target, if registered
    pub fn get(&self, target: &Target) -> Option<u64> {
        self.entries.read().get(&target.to_key()).copied()
    }

    /// Whether a target is registered
    pub fn has(&self, target: &Target) -> bool {
        self.entries.read().contains_key(&target.to_key())
    }

    /// Remove a target without firing an event (record was deleted cleanly)
    pub async fn del(&self, target: &Target) -> Result<()> {
        let removed = self.entries.write().remove(&target.to_key());
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(())
    }

    /// Delete every passed entry and broadcast an event per target
    pub async fn sweep(&self) -> Result<()> {
        let now = now_timestamp() as u64;
        let expired: Vec<(String, u64)> = {
            let mut entries = self.entries.write();
            let dead: Vec<String> = entries
                .iter()
                .filter(|(_, &expiry)| expiry <= now)
                .map(|(target, _)| target.clone())
                .collect();
            dead.into_iter()
                .filter_map(|target| entries.remove(&target).map(|expiry| (target, expiry)))
                .collect()
        };

        if expired.is_empty() {
            return Ok(());
        }
        self.persist().await?;

        for (target_key, expiry) in expired {
            match Target::parse(&target_key) {
                Ok(target) => {
                    tracing::debug!(target = %target_key, "Expired");
                    let _ = self.events.send(ExpiredEvent { target, expiry });
                }
                Err(e) => tracing::warn!("Dropping unparseable expirer entry: {e}"),
            }
        }
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        let snapshot = {
            let entries = self.entries.read();
            let list: Vec<Expiration> = entries
                .iter()
                .map(|(target, &expiry)| Expiration { target: target.clone(), expiry })
                .collect();
            serde_json::to_string(&list)?
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

    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_target_round_trip() {
        assert_eq!(Target::parse("topic:abc").unwrap(), Target::Topic("abc".into()));
        assert_eq!(Target::parse("id:42").unwrap(), Target::Id(42));
        assert_eq!(Target::Id(7).to_key(), "id:7");
        assert!(Target::parse("bogus:1").is_err());
        assert!(Target::parse("id:notanumber").is_err());
    }

    #[tokio::test]
    async fn test_set_has_del() {
        let expirer = Expirer::new(Arc::new(MemoryStorage::new()));
        let target = Target::Topic("t1".into());

        expirer.set(target.clone(), 9_999_999_999).await.unwrap();
        assert!(expirer.has(&target));
        assert_eq!(expirer.get(&target), Some(9_999_999_999));

        expirer.del(&target).await.unwrap();
        assert!(!expirer.has(&target));
    }

    #[tokio::test]
    async fn test_sweep_emits_and_deletes_passed_entries() {
        let expirer = Expirer::new(Arc::new(MemoryStorage::new()));
        let mut events = expirer.subscribe();

        // One already passed, one far in the future
        expirer.set(Target::Id(1), 1).await.unwrap();
        expirer.set(Target::Topic("alive".into()), 9_999_999_999).await.unwrap();

        expirer.sweep().await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.target, Target::Id(1));
        assert!(!expirer.has(&Target::Id(1)));
        assert!(expirer.has(&Target::Topic("alive".into())));

        // Second sweep finds nothing new
        expirer.sweep().await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refresh_keeps_single_entry() {
        let expirer = Expirer::new(Arc::new(MemoryStorage::new()));
        let target = Target::Topic("t".into());

        expirer.set(target.clone(), 100).await.unwrap();
        expirer.set(target.clone(), 9_999_999_999).await.unwrap();

        // Refreshed entry survives the sweep
        expirer.sweep().await.unwrap();
        assert!(expirer.has(&target));
    }
}
