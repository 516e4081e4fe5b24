//! Pending mutation record and drain report.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::priority::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A local write waiting to be replayed against the remote store.
///
/// `enqueued_at` and `seq` are stamped by the queue on enqueue; whatever the
/// caller put there is overwritten.
///
/// ```
/// use offline_sync::{PendingMutation, Priority};
/// use serde_json::json;
///
/// let m = PendingMutation::update("deliveries", "d7", json!({"status": "delivered"}))
///     .with_priority(Priority::High)
///     .with_base_updated_at(1_700_000_000_000);
///
/// assert!(m.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: Uuid,
    pub collection: String,
    pub document_id: String,
    pub kind: MutationKind,
    /// Full document for Create, partial document for Update, absent for Delete
    #[serde(default)]
    pub payload: Option<Value>,
    pub enqueued_at: i64,
    pub priority: Priority,
    /// Server `updated_at` the client last saw; becomes a write precondition
    #[serde(default)]
    pub base_updated_at: Option<i64>,
    /// Enqueue sequence, tiebreak within equal `(priority, enqueued_at)`
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingMutation {
    fn new(collection: impl Into<String>, document_id: impl Into<String>, kind: MutationKind, payload: Option<Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            document_id: document_id.into(),
            kind,
            payload,
            enqueued_at: 0,
            priority: Priority::Medium,
            base_updated_at: None,
            seq: 0,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn create(collection: impl Into<String>, document_id: impl Into<String>, document: Value) -> Self {
        Self::new(collection, document_id, MutationKind::Create, Some(document))
    }

    pub fn update(collection: impl Into<String>, document_id: impl Into<String>, partial: Value) -> Self {
        Self::new(collection, document_id, MutationKind::Update, Some(partial))
    }

    pub fn delete(collection: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self::new(collection, document_id, MutationKind::Delete, None)
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_base_updated_at(mut self, updated_at: i64) -> Self {
        self.base_updated_at = Some(updated_at);
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.collection.is_empty() {
            return Err(SyncError::invalid("mutation collection must not be empty"));
        }
        if self.document_id.is_empty() {
            return Err(SyncError::invalid("mutation document id must not be empty"));
        }
        match (self.kind, &self.payload) {
            (MutationKind::Create | MutationKind::Update, None) => Err(SyncError::invalid(format!(
                "{} mutation for {}/{} requires a payload",
                self.kind.as_str(),
                self.collection,
                self.document_id
            ))),
            (MutationKind::Create | MutationKind::Update, Some(payload)) if !payload.is_object() => {
                Err(SyncError::invalid("mutation payload must be a JSON object"))
            }
            (MutationKind::Delete, Some(_)) => Err(SyncError::invalid("delete mutation must not carry a payload")),
            _ => Ok(()),
        }
    }

    /// Drain order: priority (Critical first), then enqueue time, then sequence.
    pub fn drain_order(&self, other: &Self) -> Ordering {
        (self.priority, self.enqueued_at, self.seq).cmp(&(other.priority, other.enqueued_at, other.seq))
    }

    pub(crate) fn document_key(&self) -> (String, String) {
        (self.collection.clone(), self.document_id.clone())
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Mutations considered (excludes held-back ones)
    pub attempted: usize,
    /// Applied on first try
    pub applied: usize,
    /// Conflicted, then reapplied unconditionally
    pub reapplied: usize,
    /// Conflicted and superseded by a newer server write
    pub discarded: usize,
    /// Transient failures, left queued
    pub failed: usize,
    /// Skipped because an earlier mutation on the same document failed
    pub held: usize,
    pub last_error: Option<String>,
    /// Another drain was already running; nothing was done
    pub skipped: bool,
}

impl DrainReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    /// Mutations that left the queue.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.applied + self.reapplied + self.discarded
    }

    /// Fold a later pass into this one.
    pub fn absorb(&mut self, other: DrainReport) {
        self.attempted += other.attempted;
        self.applied += other.applied;
        self.reapplied += other.reapplied;
        self.discarded += other.discarded;
        self.failed += other.failed;
        self.held += other.held;
        if other.last_error.is_some() {
            self.last_error = other.last_error;
        }
        self.skipped &= other.skipped;
    }
}
