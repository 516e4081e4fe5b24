// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed durable store.
//!
//! One table of opaque blobs:
//! ```sql
//! CREATE TABLE kv (
//!   key   TEXT PRIMARY KEY,
//!   value BLOB NOT NULL
//! )
//! ```
//!
//! Runs through sqlx's `Any` driver, so the `sqlite:` URL can be swapped for
//! any other backend sqlx supports without touching callers.

use async_trait::async_trait;
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;
use tracing::info;

use crate::resilience::retry::{retry, RetryConfig};
use super::traits::{DurableStore, StorageError};

static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

pub struct SqliteDurableStore {
    pool: AnyPool,
}

impl SqliteDurableStore {
    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().to_string_lossy());
        Self::connect(&url, 4).await
    }

    /// Private in-memory database. Single connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Connect with startup-mode retry (fails fast on a bad URL).
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();

        let pool = retry("durable_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool };
        if url.starts_with("sqlite:") && !url.contains(":memory:") {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;

        info!(url, "Durable store ready");
        Ok(store)
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value BLOB NOT NULL)")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to create kv table: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => {
                let value: Vec<u8> = row
                    .try_get("value")
                    .map_err(|e| StorageError::Corruption {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO kv (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value.to_vec())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // substr() instead of LIKE: keys may contain '%' or '_'
        let rows = sqlx::query("SELECT key FROM kv WHERE substr(key, 1, ?) = ? ORDER BY key")
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("key")
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = SqliteDurableStore::in_memory().await.unwrap();
        store.set("cache:a", &[1, 2, 3]).await.unwrap();
        assert_eq!(store.get("cache:a").await.unwrap(), Some(vec![1, 2, 3]));

        store.set("cache:a", &[9]).await.unwrap();
        assert_eq!(store.get("cache:a").await.unwrap(), Some(vec![9]));

        store.delete("cache:a").await.unwrap();
        assert_eq!(store.get("cache:a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prefix_scan_is_literal() {
        let store = SqliteDurableStore::in_memory().await.unwrap();
        for key in ["queue:b", "queue:a", "cache:x", "queue_z", "sync:status"] {
            store.set(key, b"v").await.unwrap();
        }
        assert_eq!(store.keys_with_prefix("queue:").await.unwrap(), ["queue:a", "queue:b"]);
        assert!(store.keys_with_prefix("nothing:").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("durable.db");
        {
            let store = SqliteDurableStore::open(&path).await.unwrap();
            store.set("queue:1", b"pending").await.unwrap();
        }
        let store = SqliteDurableStore::open(&path).await.unwrap();
        assert_eq!(store.get("queue:1").await.unwrap(), Some(b"pending".to_vec()));
    }
}
