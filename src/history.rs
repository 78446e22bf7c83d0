//! # JSON-RPC History
//!
//! Records request/response pairs per topic. Two guarantees hang off this
//! ledger:
//!
//! - **Idempotent bookkeeping**: setting the same id twice is a no-op, so
//!   at-least-once relay redelivery cannot duplicate a request.
//! - **Duplicate response suppression**: resolving an unknown or
//!   already-resolved id is ignored, so a redelivered response never
//!   reaches a caller twice.
//!
//! Records are set synchronously with respect to request send, so a
//! response can never be processed before its request is known here.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::storage::{storage_key, Storage};
use crate::time::{expiry_from_ttl, now_timestamp, THIRTY_DAYS};

/// Version segment of the history storage key
const HISTORY_VERSION: &str = "0.3";

/// One request (and eventually its response) on a topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// JSON-RPC request id
    pub id: u64,
    /// Topic the request was sent/received on
    pub topic: String,
    /// The request payload
    pub request: Value,
    /// The response payload, once resolved
    pub response: Option<Value>,
    /// Optional chain context of the request
    pub chain_id: Option<String>,
    /// Unix seconds after which the record is pruned
    pub expiry: u64,
}

/// Request/response ledger
pub struct History {
    storage: Storage,
    records: RwLock<HashMap<u64, HistoryRecord>>,
    storage_key: String,
}

impl History {
    /// Create a history ledger over a storage backend
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            records: RwLock::new(HashMap::new()),
            storage_key: storage_key("core", HISTORY_VERSION, "history"),
        }
    }

    /// Restore persisted records
    pub async fn init(&self) -> Result<()> {
        match self.storage.get(&self.storage_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<HistoryRecord>>(&raw) {
                Ok(list) => {
                    let mut records = self.records.write();
                    for record in list {
                        records.insert(record.id, record);
                    }
                }
                Err(e) => tracing::warn!("Corrupt history blob, starting fresh: {e}"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read history, starting fresh: {e}"),
        }
        Ok(())
    }

    /// Record an outbound or inbound request
    ///
    /// Idempotent: if a record with this id already exists the call is a
    /// no-op and the existing record is NOT overwritten.
    pub async fn set(
        &self,
        topic: &str,
        id: u64,
        request: Value,
        chain_id: Option<String>,
    ) -> Result<()> {
        {
            let mut records = self.records.write();
            if records.contains_key(&id) {
                tracing::debug!(id, topic, "History record already exists, ignoring");
                return Ok(());
            }
            records.insert(
                id,
                HistoryRecord {
                    id,
                    topic: topic.to_string(),
                    request,
                    response: None,
                    chain_id,
                    expiry: expiry_from_ttl(THIRTY_DAYS),
                },
            );
        }
        self.persist().await
    }

    /// Attach a response to a recorded request
    ///
    /// Returns `true` if this was the first response for a known id on the
    /// matching topic; `false` (ignored) for unknown ids, topic mismatches,
    /// and duplicates.
    pub async fn resolve(&self, topic: &str, id: u64, response: Value) -> Result<bool> {
        let resolved = {
            let mut records = self.records.write();
            match records.get_mut(&id) {
                Some(record) if record.topic == topic && record.response.is_none() => {
                    record.response = Some(response);
                    true
                }
                _ => false,
            }
        };
        if resolved {
            self.persist().await?;
        } else {
            tracing::debug!(id, topic, "Ignoring response for unknown or resolved id");
        }
        Ok(resolved)
    }

    /// Whether a request with this id was seen on this topic
    pub fn exists(&self, topic: &str, id: u64) -> bool {
        self.records
            .read()
            .get(&id)
            .map(|record| record.topic == topic)
            .unwrap_or(false)
    }

    /// Fetch a record by id
    pub fn get(&self, id: u64) -> Option<HistoryRecord> {
        self.records.read().get(&id).cloned()
    }

    /// Requests still awaiting a response (pending-request recovery)
    pub fn pending(&self) -> Vec<HistoryRecord> {
        self.records
            .read()
            .values()
            .filter(|record| record.response.is_none())
            .cloned()
            .collect()
    }

    /// Delete every record for a topic (session/pairing teardown)
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        let removed = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|_, record| record.topic != topic);
            before != records.len()
        };
        if removed {
            self.persist().await?;
        }
        Ok(())
    }

    /// Drop records past their retention expiry (heartbeat-driven)
    pub async fn prune(&self) -> Result<()> {
        let now = now_timestamp() as u64;
        let removed = {
            let mut records = self.records.write();
            let before = records.len();
            records.retain(|_, record| record.expiry > now);
            before != records.len()
        };
        if removed {
            self.persist().await?;
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

    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStorage;

    fn history() -> History {
        History::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        let history = history();

        history.set("t1", 1, json!({"method": "wc_sessionRequest"}), None).await.unwrap();
        history.set("t1", 1, json!({"method": "OVERWRITE"}), None).await.unwrap();

        let record = history.get(1).unwrap();
        assert_eq!(record.request["method"], "wc_sessionRequest");
        assert!(history.exists("t1", 1));
        assert!(!history.exists("other-topic", 1));
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let history = history();
        history.set("t1", 1, json!({}), None).await.unwrap();

        assert!(history.resolve("t1", 1, json!({"result": true})).await.unwrap());
        assert!(!history.resolve("t1", 1, json!({"result": false})).await.unwrap());

        // Unknown id and wrong topic are also ignored
        assert!(!history.resolve("t1", 999, json!({})).await.unwrap());
        assert!(!history.resolve("t2", 1, json!({})).await.unwrap());
    }

    #[tokio::test]
    async fn test_pending_lists_unresolved() {
        let history = history();
        history.set("t1", 1, json!({}), None).await.unwrap();
        history.set("t1", 2, json!({}), None).await.unwrap();
        history.resolve("t1", 1, json!({})).await.unwrap();

        let pending = history.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 2);
    }

    #[tokio::test]
    async fn test_delete_topic_removes_all_records() {
        let history = history();
        history.set("t1", 1, json!({}), None).await.unwrap();
        history.set("t1", 2, json!({}), None).await.unwrap();
        history.set("t2", 3, json!({}), None).await.unwrap();

        history.delete_topic("t1").await.unwrap();
        assert!(!history.exists("t1", 1));
        assert!(!history.exists("t1", 2));
        assert!(history.exists("t2", 3));
    }
}
