// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, priority-ordered queue of local writes awaiting replay.
//!
//! Each mutation is written to the durable store under `queue:{id}` before it
//! becomes visible in memory, so `enqueue` returning `Ok` means the write
//! survives a restart. Replay is at-least-once.
//!
//! # Drain
//!
//! ```text
//! sorted snapshot ──► apply with precondition ──► Ok ─────────────► remove, write-through
//!                              │
//!                              ├─ Conflict/NotFound ─► get remote ─► resolver
//!                              │                                   ├─ Discard ► remove
//!                              │                                   └─ Reapply ► apply unconditionally
//!                              └─ other error ─► keep, hold back later writes to the same document
//! ```
//!
//! Only one drain runs at a time; a concurrent call returns a skipped report.

mod mutation;
mod replay;

pub use mutation::{DrainReport, MutationKind, PendingMutation};

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::conflict::ConflictResolver;
use crate::error::SyncResult;
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::traits::{DurableStore, RemoteStore};
use replay::Outcome;

/// Durable key prefix for queued mutations.
pub const QUEUE_KEY_PREFIX: &str = "queue:";

fn durable_key(id: &Uuid) -> String {
    format!("{}{}", QUEUE_KEY_PREFIX, id)
}

/// Everything a drain needs besides the queue itself.
pub struct Replayer<'a> {
    pub remote: &'a dyn RemoteStore,
    pub resolver: &'a ConflictResolver,
    pub breaker: Option<&'a CircuitBreaker>,
}

pub struct MutationQueue {
    /// Kept sorted by drain order
    pending: Mutex<Vec<PendingMutation>>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    next_seq: AtomicU64,
    draining: AtomicBool,
}

impl MutationQueue {
    pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            durable,
            clock,
            next_seq: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        }
    }

    /// Validate, stamp, persist, then publish in memory.
    ///
    /// Returns the stored mutation (with `enqueued_at` and `seq` filled in).
    pub async fn enqueue(&self, mut mutation: PendingMutation) -> SyncResult<PendingMutation> {
        mutation.validate()?;
        mutation.enqueued_at = self.clock.now_millis();
        mutation.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        mutation.attempts = 0;
        mutation.last_error = None;

        let bytes = serde_json::to_vec(&mutation)?;
        let key = durable_key(&mutation.id);
        retry("queue_persist", &RetryConfig::durable_write(), || async {
            self.durable.set(&key, &bytes).await
        })
        .await?;

        let depth = self.insert_sorted(mutation.clone());
        crate::metrics::record_enqueue(mutation.kind.as_str(), mutation.priority);
        crate::metrics::set_queue_depth(depth);
        debug!(
            mutation = %mutation.id,
            kind = mutation.kind.as_str(),
            collection = %mutation.collection,
            document = %mutation.document_id,
            priority = %mutation.priority,
            depth,
            "Mutation enqueued"
        );
        Ok(mutation)
    }

    /// Reload persisted mutations. Malformed records are dropped.
    pub async fn load_from_durable(&self) -> SyncResult<usize> {
        let mut loaded = Vec::new();
        for key in self.durable.keys_with_prefix(QUEUE_KEY_PREFIX).await? {
            let Some(bytes) = self.durable.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<PendingMutation>(&bytes) {
                Ok(m) if m.validate().is_ok() => loaded.push(m),
                Ok(_) | Err(_) => {
                    warn!(key = %key, "Dropping malformed queued mutation");
                    crate::metrics::record_corruption("queue");
                    self.durable.delete(&key).await?;
                }
            }
        }

        let count = loaded.len();
        let max_seq = loaded.iter().map(|m| m.seq).max();
        {
            let mut pending = self.pending.lock();
            let known: HashSet<Uuid> = pending.iter().map(|m| m.id).collect();
            pending.extend(loaded.into_iter().filter(|m| !known.contains(&m.id)));
            pending.sort_by(|a, b| a.drain_order(b));
            crate::metrics::set_queue_depth(pending.len());
        }
        if let Some(max_seq) = max_seq {
            self.next_seq.fetch_max(max_seq + 1, Ordering::Relaxed);
        }
        if count > 0 {
            info!(count, "Pending mutations restored from durable store");
        }
        Ok(count)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending mutations in drain order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingMutation> {
        self.pending.lock().clone()
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Replay every currently queued mutation once.
    ///
    /// Mutations enqueued while this runs wait for the next drain.
    pub async fn drain_once(&self, replayer: &Replayer<'_>) -> DrainReport {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain already in progress");
            return DrainReport::skipped();
        }
        let _guard = DrainGuard(&self.draining);
        let _timer = crate::metrics::LatencyTimer::new("queue", "drain");

        let batch = self.snapshot();
        let mut report = DrainReport::default();
        if batch.is_empty() {
            return report;
        }

        let started = Instant::now();
        info!(pending = batch.len(), "Draining mutation queue");
        let mut blocked: HashSet<(String, String)> = HashSet::new();

        for mutation in &batch {
            if blocked.contains(&mutation.document_key()) {
                report.held += 1;
                continue;
            }
            report.attempted += 1;

            match replay::replay(mutation, replayer).await {
                Outcome::Applied => {
                    report.applied += 1;
                    self.complete(&mutation.id).await;
                }
                Outcome::Reapplied => {
                    report.reapplied += 1;
                    self.complete(&mutation.id).await;
                }
                Outcome::Discarded => {
                    report.discarded += 1;
                    self.complete(&mutation.id).await;
                }
                Outcome::Failed(error) => {
                    warn!(
                        mutation = %mutation.id,
                        collection = %mutation.collection,
                        document = %mutation.document_id,
                        error = %error,
                        "Replay failed, mutation stays queued"
                    );
                    report.failed += 1;
                    report.last_error = Some(error.to_string());
                    blocked.insert(mutation.document_key());
                    self.mark_failed(&mutation.id, error.to_string());
                }
            }
        }

        let depth = self.len();
        crate::metrics::set_queue_depth(depth);
        crate::metrics::record_drain_outcome("applied", report.applied);
        crate::metrics::record_drain_outcome("reapplied", report.reapplied);
        crate::metrics::record_drain_outcome("discarded", report.discarded);
        crate::metrics::record_drain_outcome("failed", report.failed);
        crate::metrics::record_drain_outcome("held", report.held);
        crate::metrics::record_drain(started.elapsed(), report.failed == 0);
        info!(
            applied = report.applied,
            reapplied = report.reapplied,
            discarded = report.discarded,
            failed = report.failed,
            held = report.held,
            remaining = depth,
            "Drain complete"
        );
        report
    }

    fn insert_sorted(&self, mutation: PendingMutation) -> usize {
        let mut pending = self.pending.lock();
        let at = pending.partition_point(|m| m.drain_order(&mutation).is_le());
        pending.insert(at, mutation);
        pending.len()
    }

    /// Remove from memory, then from the durable store.
    ///
    /// A failed durable delete means the mutation is replayed again after a
    /// restart, which at-least-once delivery allows.
    async fn complete(&self, id: &Uuid) {
        self.pending.lock().retain(|m| m.id != *id);
        if let Err(e) = self.durable.delete(&durable_key(id)).await {
            warn!(mutation = %id, error = %e, "Failed to delete replayed mutation from durable store");
            crate::metrics::record_durable_error("queue_delete");
        }
    }

    fn mark_failed(&self, id: &Uuid, error: String) {
        let mut pending = self.pending.lock();
        if let Some(m) = pending.iter_mut().find(|m| m.id == *id) {
            m.attempts = m.attempts.saturating_add(1);
            m.last_error = Some(error);
        }
    }
}

/// RAII guard to reset the draining flag
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TimedCache;
    use crate::clock::ManualClock;
    use crate::conflict::MissingTimestampPolicy;
    use crate::document::Document;
    use crate::priority::Priority;
    use crate::status::StatusPublisher;
    use crate::storage::memory::{InMemoryDurableStore, InMemoryRemoteStore, RemoteOpKind};
    use serde_json::json;

    struct Fixture {
        queue: MutationQueue,
        remote: InMemoryRemoteStore,
        resolver: ConflictResolver,
        cache: Arc<TimedCache>,
        durable: Arc<InMemoryDurableStore>,
        clock: ManualClock,
    }

    impl Fixture {
        fn new() -> Self {
            let durable = Arc::new(InMemoryDurableStore::new());
            let clock = ManualClock::new(1_000);
            let shared: Arc<dyn Clock> = Arc::new(clock.clone());
            let cache = Arc::new(TimedCache::new(durable.clone(), shared.clone(), 0));
            let status = Arc::new(StatusPublisher::new(durable.clone(), shared.clone()));
            Self {
                queue: MutationQueue::new(durable.clone(), shared.clone()),
                remote: InMemoryRemoteStore::new(shared),
                resolver: ConflictResolver::new(cache.clone(), status, MissingTimestampPolicy::Reapply),
                cache,
                durable,
                clock,
            }
        }

        async fn drain(&self) -> DrainReport {
            let replayer = Replayer {
                remote: &self.remote,
                resolver: &self.resolver,
                breaker: None,
            };
            self.queue.drain_once(&replayer).await
        }
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_visible() {
        let f = Fixture::new();
        let stored = f.queue.enqueue(PendingMutation::create("patients", "p1", json!({"a": 1}))).await.unwrap();

        assert_eq!(stored.enqueued_at, 1_000);
        assert_eq!(f.queue.len(), 1);
        assert!(f.durable.contains_key(&durable_key(&stored.id)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_invalid() {
        let f = Fixture::new();
        let mut bad = PendingMutation::create("patients", "p1", json!({}));
        bad.payload = None;
        assert!(f.queue.enqueue(bad).await.is_err());
        assert!(f.queue.is_empty());
        assert!(f.durable.is_empty());
    }

    #[tokio::test]
    async fn test_drain_applies_in_priority_then_time_order() {
        let f = Fixture::new();
        f.clock.set(300);
        f.queue.enqueue(PendingMutation::create("c", "low", json!({})).with_priority(Priority::Low)).await.unwrap();
        f.clock.set(200);
        f.queue.enqueue(PendingMutation::create("c", "high-late", json!({})).with_priority(Priority::High)).await.unwrap();
        f.clock.set(100);
        f.queue.enqueue(PendingMutation::create("c", "high-early", json!({})).with_priority(Priority::High)).await.unwrap();
        f.clock.set(400);
        f.queue.enqueue(PendingMutation::create("c", "critical", json!({})).with_priority(Priority::Critical)).await.unwrap();

        let report = f.drain().await;
        assert_eq!(report.applied, 4);
        assert!(f.queue.is_empty());
        assert!(f.durable.keys_with_prefix(QUEUE_KEY_PREFIX).await.unwrap().is_empty());

        let order: Vec<_> = f.remote.operations().into_iter().map(|op| op.id).collect();
        assert_eq!(order, ["critical", "high-early", "high-late", "low"]);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_mutation_and_holds_document() {
        let f = Fixture::new();
        f.queue.enqueue(PendingMutation::create("c", "1", json!({"v": 1}))).await.unwrap();
        f.queue.enqueue(PendingMutation::update("c", "1", json!({"v": 2}))).await.unwrap();
        f.remote.set_online(false);

        let report = f.drain().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.held, 1);
        assert_eq!(f.queue.len(), 2);
        assert_eq!(f.queue.snapshot()[0].attempts, 1);
        assert!(report.last_error.unwrap().contains("unavailable"));

        f.remote.set_online(true);
        let report = f.drain().await;
        assert_eq!(report.applied, 2);
        assert_eq!(f.remote.document("c", "1").unwrap().data, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_conflict_newer_server_write_discards_and_refreshes_cache() {
        let f = Fixture::new();
        f.remote.seed(Document::new("c", "1", json!({"v": "server-old"})).with_updated_at(500));
        f.clock.set(1_000);
        f.queue
            .enqueue(PendingMutation::update("c", "1", json!({"v": "local"})).with_base_updated_at(500))
            .await
            .unwrap();
        f.remote.seed(Document::new("c", "1", json!({"v": "server-new"})).with_updated_at(1_001));

        let report = f.drain().await;
        assert_eq!(report.discarded, 1);
        assert!(f.queue.is_empty());
        assert_eq!(f.remote.document("c", "1").unwrap().data, json!({"v": "server-new"}));

        let cached: Document = f.cache.get_json("doc:c/1").await.unwrap();
        assert_eq!(cached.data, json!({"v": "server-new"}));
    }

    #[tokio::test]
    async fn test_conflict_older_server_write_reapplies() {
        let f = Fixture::new();
        f.remote.seed(Document::new("c", "1", json!({"v": "a"})).with_updated_at(500));
        f.clock.set(1_000);
        f.queue
            .enqueue(PendingMutation::update("c", "1", json!({"v": "local"})).with_base_updated_at(400))
            .await
            .unwrap();

        let report = f.drain().await;
        assert_eq!(report.reapplied, 1);
        assert_eq!(f.remote.document("c", "1").unwrap().data, json!({"v": "local"}));
    }

    #[tokio::test]
    async fn test_update_of_vanished_document_recreates_it() {
        let f = Fixture::new();
        f.queue.enqueue(PendingMutation::update("c", "gone", json!({"v": 1}))).await.unwrap();

        let report = f.drain().await;
        assert_eq!(report.reapplied, 1);
        assert!(f.remote.document("c", "gone").is_some());
        assert_eq!(f.remote.operations()[0].kind, RemoteOpKind::Create);
    }

    #[tokio::test]
    async fn test_delete_of_vanished_document_completes() {
        let f = Fixture::new();
        f.queue.enqueue(PendingMutation::delete("c", "gone").with_base_updated_at(5)).await.unwrap();

        let report = f.drain().await;
        assert_eq!(report.reapplied, 1);
        assert!(f.queue.is_empty());
        assert!(f.remote.operations().is_empty());
    }

    #[tokio::test]
    async fn test_success_writes_through_to_cache() {
        let f = Fixture::new();
        f.queue.enqueue(PendingMutation::create("c", "1", json!({"v": 1}))).await.unwrap();
        f.drain().await;
        let cached: Document = f.cache.get_json("doc:c/1").await.unwrap();
        assert_eq!(cached.updated_at, Some(1_000));

        f.queue.enqueue(PendingMutation::delete("c", "1")).await.unwrap();
        f.drain().await;
        assert!(f.cache.get("doc:c/1").await.is_none());
    }

    #[tokio::test]
    async fn test_reload_restores_order_and_drops_corrupt() {
        let f = Fixture::new();
        f.clock.set(10);
        f.queue.enqueue(PendingMutation::delete("c", "b").with_priority(Priority::Low)).await.unwrap();
        f.clock.set(20);
        f.queue.enqueue(PendingMutation::delete("c", "a").with_priority(Priority::Critical)).await.unwrap();
        f.durable.set("queue:garbage", b"{").await.unwrap();

        let reloaded = MutationQueue::new(f.durable.clone(), Arc::new(f.clock.clone()));
        assert_eq!(reloaded.load_from_durable().await.unwrap(), 2);
        let ids: Vec<_> = reloaded.snapshot().into_iter().map(|m| m.document_id).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(!f.durable.contains_key("queue:garbage"));

        let next = reloaded.enqueue(PendingMutation::delete("c", "z")).await.unwrap();
        assert_eq!(next.seq, 2);
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_skipped() {
        let f = Fixture::new();
        f.queue.draining.store(true, Ordering::SeqCst);
        f.queue.enqueue(PendingMutation::delete("c", "1")).await.unwrap();

        let report = f.drain().await;
        assert!(report.skipped);
        assert_eq!(f.queue.len(), 1);
    }
}
