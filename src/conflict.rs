// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server-timestamp-precedence conflict resolution.
//!
//! A queued mutation conflicts when the remote document moved since the
//! client last saw it (or vanished). The decision is a pure function of the
//! mutation's `enqueued_at` and the server's `updated_at`:
//!
//! ```text
//! remote.updated_at >  enqueued_at   → Discard (server wins, cache refreshed)
//! remote.updated_at <= enqueued_at   → Reapply (client intent wins)
//! remote document absent             → Reapply
//! remote.updated_at missing          → MissingTimestampPolicy
//! ```
//!
//! No field-level merge is attempted.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::TimedCache;
use crate::document::{cache_key, Document};
use crate::priority::Priority;
use crate::queue::PendingMutation;
use crate::status::StatusPublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Drop the local mutation; the server copy is authoritative
    Discard,
    /// Apply the local mutation without a precondition
    Reapply,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discard => "discard",
            Self::Reapply => "reapply",
        }
    }
}

/// Decision for a remote document that carries no `updated_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingTimestampPolicy {
    /// Treat it as older than any local write
    #[default]
    Reapply,
    /// Treat it as newer than any local write
    Discard,
}

/// Pure resolution rule.
pub fn resolve(mutation: &PendingMutation, remote: Option<&Document>, policy: MissingTimestampPolicy) -> Resolution {
    let Some(doc) = remote else {
        return Resolution::Reapply;
    };
    match doc.updated_at {
        Some(updated_at) if updated_at > mutation.enqueued_at => Resolution::Discard,
        Some(_) => Resolution::Reapply,
        None => match policy {
            MissingTimestampPolicy::Reapply => Resolution::Reapply,
            MissingTimestampPolicy::Discard => Resolution::Discard,
        },
    }
}

/// Applies [`resolve`] and keeps the local cache in line with the server.
pub struct ConflictResolver {
    cache: Arc<TimedCache>,
    status: Arc<StatusPublisher>,
    policy: MissingTimestampPolicy,
}

impl ConflictResolver {
    pub fn new(cache: Arc<TimedCache>, status: Arc<StatusPublisher>, policy: MissingTimestampPolicy) -> Self {
        Self { cache, status, policy }
    }

    /// Decide, record the conflict, and on `Discard` refresh the cache with
    /// the server's copy (or drop the cached copy if the server has none).
    pub async fn adjudicate(&self, mutation: &PendingMutation, remote: Option<&Document>) -> Resolution {
        let resolution = resolve(mutation, remote, self.policy);
        info!(
            mutation = %mutation.id,
            collection = %mutation.collection,
            document = %mutation.document_id,
            enqueued_at = mutation.enqueued_at,
            remote_updated_at = ?remote.and_then(|d| d.updated_at),
            resolution = resolution.as_str(),
            "Conflict resolved"
        );
        crate::metrics::record_conflict(resolution.as_str());
        self.status.record_conflict().await;

        if resolution == Resolution::Discard {
            match remote {
                Some(doc) => self.refresh(doc).await,
                None => self.forget(&mutation.collection, &mutation.document_id).await,
            }
        }
        resolution
    }

    /// Cache the server's current copy at High priority.
    pub async fn refresh(&self, doc: &Document) {
        if let Err(e) = self.cache.put_json(&doc.cache_key(), doc, Priority::High, None).await {
            warn!(key = %doc.cache_key(), error = %e, "Failed to refresh cached document");
        } else {
            debug!(key = %doc.cache_key(), "Cached document refreshed from server");
        }
    }

    /// Drop a cached document the server no longer has.
    pub async fn forget(&self, collection: &str, id: &str) {
        self.cache.remove(&cache_key(collection, id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::status::SyncPhase;
    use crate::storage::memory::InMemoryDurableStore;
    use serde_json::json;

    fn mutation_at(t: i64) -> PendingMutation {
        let mut m = PendingMutation::update("patients", "p1", json!({"ward": "B"}));
        m.enqueued_at = t;
        m
    }

    fn remote_at(t: Option<i64>) -> Document {
        let doc = Document::new("patients", "p1", json!({"ward": "C"}));
        match t {
            Some(t) => doc.with_updated_at(t),
            None => doc,
        }
    }

    #[test]
    fn test_newer_remote_discards() {
        let m = mutation_at(100);
        let doc = remote_at(Some(101));
        assert_eq!(resolve(&m, Some(&doc), MissingTimestampPolicy::Reapply), Resolution::Discard);
    }

    #[test]
    fn test_equal_or_older_remote_reapplies() {
        let m = mutation_at(100);
        assert_eq!(resolve(&m, Some(&remote_at(Some(100))), MissingTimestampPolicy::Reapply), Resolution::Reapply);
        assert_eq!(resolve(&m, Some(&remote_at(Some(99))), MissingTimestampPolicy::Reapply), Resolution::Reapply);
    }

    #[test]
    fn test_absent_remote_reapplies_regardless_of_policy() {
        let m = mutation_at(100);
        assert_eq!(resolve(&m, None, MissingTimestampPolicy::Discard), Resolution::Reapply);
    }

    #[test]
    fn test_missing_timestamp_follows_policy() {
        let m = mutation_at(100);
        let doc = remote_at(None);
        assert_eq!(resolve(&m, Some(&doc), MissingTimestampPolicy::Reapply), Resolution::Reapply);
        assert_eq!(resolve(&m, Some(&doc), MissingTimestampPolicy::Discard), Resolution::Discard);
    }

    #[tokio::test]
    async fn test_discard_refreshes_cache_and_counts_conflict() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(1_000));
        let cache = Arc::new(TimedCache::new(durable.clone(), clock.clone(), 0));
        let status = Arc::new(StatusPublisher::new(durable, clock));
        let resolver = ConflictResolver::new(cache.clone(), status.clone(), MissingTimestampPolicy::Reapply);

        let doc = remote_at(Some(200));
        let resolution = resolver.adjudicate(&mutation_at(100), Some(&doc)).await;

        assert_eq!(resolution, Resolution::Discard);
        let cached: Document = cache.get_json("doc:patients/p1").await.unwrap();
        assert_eq!(cached, doc);
        assert_eq!(cache.stats().count(Priority::High), 1);
        assert_eq!(status.current().conflict_count, 1);
        assert_eq!(status.current().phase, SyncPhase::ConflictResolution);
    }
}
