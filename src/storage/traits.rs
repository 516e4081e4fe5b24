//! Collaborator contracts.
//!
//! The engine consumes exactly two external services:
//! - [`RemoteStore`]: the server-authoritative document database
//! - [`DurableStore`]: a local key-value store of opaque blobs
//!
//! Both are assumed reliable at the I/O level; timeouts are theirs to enforce
//! and surface as [`StorageError::Unavailable`] or [`StorageError::Backend`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::document::Document;
use crate::query::{CursorPosition, Query};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Item not found")]
    NotFound,
    /// Write precondition failed: the server copy moved since the client saw it
    #[error("Write conflict: server document updated at {current_updated_at:?}")]
    Conflict { current_updated_at: Option<i64> },
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{key}': {reason}")]
    Corruption { key: String, reason: String },
}

impl StorageError {
    /// Failures that mean "the server state is not what this write assumed".
    ///
    /// These go to conflict resolution rather than blind retry.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::NotFound)
    }
}

/// Optimistic-concurrency guard on remote writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precondition {
    /// Apply unconditionally
    #[default]
    None,
    /// Apply only if the server document's `updated_at` equals this value
    LastUpdatedAt(i64),
}

impl From<Option<i64>> for Precondition {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Self::None, Self::LastUpdatedAt)
    }
}

/// Remote store's global synchronization signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSignal {
    /// Latest synchronization round-trip succeeded
    Synced,
    /// The store could not reach its backend
    ConnectivityError(String),
}

/// Live query snapshots. Each message is the full current result set.
pub type SnapshotStream = mpsc::Receiver<Result<Vec<Document>, StorageError>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create or overwrite a document. The server stamps `updated_at`.
    async fn create(&self, collection: &str, id: &str, data: &Value) -> Result<Document, StorageError>;

    /// Shallow-merge `partial` into an existing document.
    ///
    /// Fails with `NotFound` if absent, `Conflict` if the precondition fails.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: &Value,
        precondition: Precondition,
    ) -> Result<Document, StorageError>;

    /// Delete a document. Without a precondition, deleting an absent document succeeds.
    async fn delete(&self, collection: &str, id: &str, precondition: Precondition) -> Result<(), StorageError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError>;

    /// Run `query`, resuming strictly after `start_after` when given.
    ///
    /// Returns at most `query.limit` documents in the query's total order.
    async fn query(&self, query: &Query, start_after: Option<&CursorPosition>) -> Result<Vec<Document>, StorageError>;

    /// Open a live subscription. The first message is the initial snapshot.
    async fn subscribe(&self, query: &Query) -> Result<SnapshotStream, StorageError>;

    /// Watch the store's synchronization state.
    fn sync_state(&self) -> watch::Receiver<SyncSignal>;
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Keys beginning with `prefix`, in ascending order.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
