//! SQLite storage backend.
//!
//! A single `kv` table holding JSON strings. The connection lives behind a
//! `parking_lot::Mutex`; statements are short and the write volume is low
//! (state snapshots on mutation), so one connection is enough.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::KeyValueStorage;
use crate::error::{Error, Result};

/// Durable key-value store backed by SQLite
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a database at `path`. Pass `None` for an
    /// in-memory database, which is mainly useful in tests.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(path) => Connection::open(path)
                .map_err(|e| Error::StorageReadError(format!("Failed to open database: {e}")))?,
            None => Connection::open_in_memory()
                .map_err(|e| Error::StorageReadError(format!("Failed to open database: {e}")))?,
        };

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| Error::StorageWriteError(format!("Failed to create schema: {e}")))?;

        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait]
impl KeyValueStorage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .lock()
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| Error::StorageWriteError(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| Error::StorageWriteError(e.to_string()))?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let storage = SqliteStorage::open(None).unwrap();

        storage.set("wc@2:core:1//keychain", "{\"a\":1}").await.unwrap();
        assert_eq!(
            storage.get("wc@2:core:1//keychain").await.unwrap(),
            Some("{\"a\":1}".to_string())
        );

        // Overwrite
        storage.set("wc@2:core:1//keychain", "{\"a\":2}").await.unwrap();
        assert_eq!(
            storage.get("wc@2:core:1//keychain").await.unwrap(),
            Some("{\"a\":2}".to_string())
        );

        storage.remove("wc@2:core:1//keychain").await.unwrap();
        assert_eq!(storage.get("wc@2:core:1//keychain").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");
        let path = path.to_str().unwrap();

        {
            let storage = SqliteStorage::open(Some(path)).unwrap();
            storage.set("k", "v").await.unwrap();
        }

        let storage = SqliteStorage::open(Some(path)).unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));
    }
}
