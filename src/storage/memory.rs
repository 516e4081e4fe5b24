//! In-memory implementations of the collaborator traits.
//!
//! [`InMemoryRemoteStore`] behaves like a small document database: it stamps
//! `updated_at` from its clock, enforces write preconditions, evaluates
//! filters/orderings/cursors, pushes live snapshots, and exposes a switchable
//! connectivity signal. It also records every applied write so tests can
//! assert exactly-once delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::document::Document;
use crate::query::value_order::{compare_documents, compare_to_position};
use crate::query::{CursorPosition, Query};
use super::traits::{DurableStore, Precondition, RemoteStore, SnapshotStream, StorageError, SyncSignal};

const SNAPSHOT_BUFFER: usize = 64;

/// Kind of write applied to the in-memory remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOpKind {
    Create,
    Update,
    Delete,
}

/// One applied write, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOp {
    pub kind: RemoteOpKind,
    pub collection: String,
    pub id: String,
}

struct Listener {
    query: Query,
    tx: mpsc::Sender<Result<Vec<Document>, StorageError>>,
}

pub struct InMemoryRemoteStore {
    docs: DashMap<(String, String), Document>,
    clock: Arc<dyn Clock>,
    online: AtomicBool,
    signal: watch::Sender<SyncSignal>,
    listeners: Mutex<Vec<Listener>>,
    log: Mutex<Vec<RemoteOp>>,
}

impl InMemoryRemoteStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (signal, _) = watch::channel(SyncSignal::Synced);
        Self {
            docs: DashMap::new(),
            clock,
            online: AtomicBool::new(true),
            signal,
            listeners: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Flip connectivity. Going offline makes every call fail with
    /// `Unavailable` and publishes a connectivity error on the sync signal.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        let signal = if online {
            SyncSignal::Synced
        } else {
            SyncSignal::ConnectivityError("network unreachable".into())
        };
        self.signal.send_replace(signal);
        debug!(online, "In-memory remote connectivity changed");
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Insert a document exactly as given (server-side write by another client).
    pub fn seed(&self, doc: Document) {
        let collection = doc.collection.clone();
        self.docs.insert((doc.collection.clone(), doc.id.clone()), doc);
        self.notify(&collection);
    }

    #[must_use]
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.docs
            .get(&(collection.to_string(), id.to_string()))
            .map(|r| r.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Writes applied so far, oldest first.
    #[must_use]
    pub fn operations(&self) -> Vec<RemoteOp> {
        self.log.lock().clone()
    }

    /// Push an error to every live subscription on `collection`.
    pub fn fail_subscriptions(&self, collection: &str, error: StorageError) {
        let listeners = self.listeners.lock();
        for listener in listeners.iter().filter(|l| l.query.collection == collection) {
            let _ = listener.tx.try_send(Err(error.clone()));
        }
    }

    /// Number of subscriptions whose receiver is still open.
    #[must_use]
    pub fn live_listeners(&self) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| !l.tx.is_closed());
        listeners.len()
    }

    fn ensure_online(&self) -> Result<(), StorageError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("network unreachable".into()))
        }
    }

    fn record(&self, kind: RemoteOpKind, collection: &str, id: &str) {
        self.log.lock().push(RemoteOp {
            kind,
            collection: collection.to_string(),
            id: id.to_string(),
        });
    }

    fn run_query(&self, query: &Query, start_after: Option<&CursorPosition>) -> Vec<Document> {
        let mut matched: Vec<Document> = self
            .docs
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| compare_documents(a, b, &query.order_by));

        let resumed = matched.into_iter().filter(|doc| match start_after {
            Some(pos) => compare_to_position(doc, pos, &query.order_by) == std::cmp::Ordering::Greater,
            None => true,
        });
        match query.limit {
            Some(limit) => resumed.take(limit).collect(),
            None => resumed.collect(),
        }
    }

    fn notify(&self, collection: &str) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| !l.tx.is_closed());
        for listener in listeners.iter().filter(|l| l.query.collection == collection) {
            let snapshot = self.run_query(&listener.query, None);
            if let Err(mpsc::error::TrySendError::Full(_)) = listener.tx.try_send(Ok(snapshot)) {
                warn!(collection, "Subscriber lagging, snapshot dropped");
            }
        }
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create(&self, collection: &str, id: &str, data: &Value) -> Result<Document, StorageError> {
        self.ensure_online()?;
        let doc = Document::new(collection, id, data.clone()).with_updated_at(self.clock.now_millis());
        self.docs.insert((collection.to_string(), id.to_string()), doc.clone());
        self.record(RemoteOpKind::Create, collection, id);
        self.notify(collection);
        Ok(doc)
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        partial: &Value,
        precondition: Precondition,
    ) -> Result<Document, StorageError> {
        self.ensure_online()?;
        let updated = {
            let mut entry = self
                .docs
                .get_mut(&(collection.to_string(), id.to_string()))
                .ok_or(StorageError::NotFound)?;
            if let Precondition::LastUpdatedAt(expected) = precondition {
                if entry.updated_at != Some(expected) {
                    return Err(StorageError::Conflict {
                        current_updated_at: entry.updated_at,
                    });
                }
            }
            entry.merge(partial);
            entry.updated_at = Some(self.clock.now_millis());
            entry.clone()
        };
        self.record(RemoteOpKind::Update, collection, id);
        self.notify(collection);
        Ok(updated)
    }

    async fn delete(&self, collection: &str, id: &str, precondition: Precondition) -> Result<(), StorageError> {
        self.ensure_online()?;
        let key = (collection.to_string(), id.to_string());
        if let Precondition::LastUpdatedAt(expected) = precondition {
            let current = self.docs.get(&key).ok_or(StorageError::NotFound)?.updated_at;
            if current != Some(expected) {
                return Err(StorageError::Conflict {
                    current_updated_at: current,
                });
            }
        }
        self.docs.remove(&key);
        self.record(RemoteOpKind::Delete, collection, id);
        self.notify(collection);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        self.ensure_online()?;
        Ok(self.document(collection, id))
    }

    async fn query(&self, query: &Query, start_after: Option<&CursorPosition>) -> Result<Vec<Document>, StorageError> {
        self.ensure_online()?;
        Ok(self.run_query(query, start_after))
    }

    async fn subscribe(&self, query: &Query) -> Result<SnapshotStream, StorageError> {
        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let initial = self.run_query(query, None);
        // Fresh channel, capacity > 0: cannot be full
        let _ = tx.try_send(Ok(initial));
        self.listeners.lock().push(Listener {
            query: query.clone(),
            tx,
        });
        Ok(rx)
    }

    fn sync_state(&self) -> watch::Receiver<SyncSignal> {
        self.signal.subscribe()
    }
}

/// Durable store stand-in backed by a `DashMap`.
#[derive(Default)]
pub struct InMemoryDurableStore {
    data: DashMap<String, Vec<u8>>,
}

impl InMemoryDurableStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.get(key).map(|r| r.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<String> = self
            .data
            .iter()
            .filter(|r| r.key().starts_with(prefix))
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
