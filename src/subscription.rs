// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Capped pool of live query subscriptions.
//!
//! Each subscription owns one tokio task reading the remote snapshot stream.
//! For every snapshot the task feeds the documents into the cache, invokes the
//! caller's callback, and records the delivery in [`QueryMetrics`] under
//! `subscription:{id}`.
//!
//! # Cap
//!
//! When the pool is full, the oldest non-pinned subscriptions are cancelled
//! in one batch (at least `eviction_batch`, at least enough to free one slot).
//! If not enough are evictable the new subscription is refused.
//!
//! # Cancellation
//!
//! `unsubscribe` clears the subscription's active flag before returning and
//! aborts its task. The task checks the flag before touching the cache and
//! again right before the callback, so at most a delivery that had already
//! passed that check completes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::TimedCache;
use crate::clock::Clock;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::priority::Priority;
use crate::query::{Query, QueryMetrics};
use crate::storage::traits::{RemoteStore, SnapshotStream, StorageError};

pub type DataCallback = Arc<dyn Fn(&[Document]) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&StorageError) + Send + Sync>;

/// What to subscribe to and where to deliver it.
///
/// ```
/// use offline_sync::query::{Query, Filter};
/// use offline_sync::subscription::SubscriptionRequest;
///
/// let request = SubscriptionRequest::new(
///     "ward-b-vitals",
///     Query::collection("vitals").filter(Filter::eq("ward", "B")),
///     |docs| println!("{} readings", docs.len()),
/// )
/// .on_error(|e| eprintln!("vitals feed failed: {}", e))
/// .pinned();
///
/// assert!(request.is_pinned());
/// ```
pub struct SubscriptionRequest {
    id: String,
    query: Query,
    on_data: DataCallback,
    on_error: Option<ErrorCallback>,
    pinned: bool,
}

impl SubscriptionRequest {
    pub fn new(id: impl Into<String>, query: Query, on_data: impl Fn(&[Document]) + Send + Sync + 'static) -> Self {
        Self {
            id: id.into(),
            query,
            on_data: Arc::new(on_data),
            on_error: None,
            pinned: false,
        }
    }

    #[must_use]
    pub fn on_error(mut self, on_error: impl Fn(&StorageError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Never force-evicted to make room.
    #[must_use]
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// Returned by a successful subscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: String,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// False once unsubscribed, replaced, or evicted.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: String,
    pub collection: String,
    pub started_at: i64,
    pub pinned: bool,
}

struct LiveSubscription {
    collection: String,
    started_at: i64,
    /// Creation order, tiebreak for equal `started_at`
    seq: u64,
    pinned: bool,
    active: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl LiveSubscription {
    fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        self.task.abort();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OnDuplicate {
    Replace,
    Reject,
}

pub struct SubscriptionManager {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<TimedCache>,
    metrics: Arc<QueryMetrics>,
    clock: Arc<dyn Clock>,
    table: Mutex<HashMap<String, LiveSubscription>>,
    cap: AtomicUsize,
    eviction_batch: AtomicUsize,
    max_limit: AtomicUsize,
    next_seq: AtomicU64,
    cache_priority: Priority,
}

impl SubscriptionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<TimedCache>,
        metrics: Arc<QueryMetrics>,
        clock: Arc<dyn Clock>,
        cap: usize,
        eviction_batch: usize,
        max_limit: usize,
        cache_priority: Priority,
    ) -> Self {
        Self {
            remote,
            cache,
            metrics,
            clock,
            table: Mutex::new(HashMap::new()),
            cap: AtomicUsize::new(cap),
            eviction_batch: AtomicUsize::new(eviction_batch),
            max_limit: AtomicUsize::new(max_limit),
            next_seq: AtomicU64::new(0),
            cache_priority,
        }
    }

    /// Subscribe, cancelling any live subscription with the same id first.
    pub async fn subscribe(&self, request: SubscriptionRequest) -> SyncResult<SubscriptionHandle> {
        self.open(request, OnDuplicate::Replace).await
    }

    /// Subscribe, failing with `DuplicateSubscription` if the id is live.
    pub async fn try_subscribe(&self, request: SubscriptionRequest) -> SyncResult<SubscriptionHandle> {
        self.open(request, OnDuplicate::Reject).await
    }

    async fn open(&self, request: SubscriptionRequest, on_duplicate: OnDuplicate) -> SyncResult<SubscriptionHandle> {
        if request.id.is_empty() {
            return Err(SyncError::invalid("subscription id must not be empty"));
        }
        request.query.validate(self.max_limit.load(Ordering::Relaxed))?;
        if on_duplicate == OnDuplicate::Reject && self.table.lock().contains_key(&request.id) {
            return Err(SyncError::DuplicateSubscription(request.id));
        }

        let stream = self.remote.subscribe(&request.query).await?;

        let mut table = self.table.lock();
        if let Some(existing) = table.get(&request.id) {
            if on_duplicate == OnDuplicate::Reject {
                return Err(SyncError::DuplicateSubscription(request.id));
            }
            existing.cancel();
            table.remove(&request.id);
            debug!(subscription = %request.id, "Replaced existing subscription");
        }
        self.make_room(&mut table)?;

        let active = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(deliver(
            Delivery {
                metric_id: format!("subscription:{}", request.id),
                active: active.clone(),
                on_data: request.on_data,
                on_error: request.on_error,
                cache: self.cache.clone(),
                metrics: self.metrics.clone(),
                cache_priority: self.cache_priority,
            },
            stream,
        ));
        table.insert(
            request.id.clone(),
            LiveSubscription {
                collection: request.query.collection.clone(),
                started_at: self.clock.now_millis(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                pinned: request.pinned,
                active: active.clone(),
                task,
            },
        );
        crate::metrics::set_subscription_count(table.len());
        info!(
            subscription = %request.id,
            collection = %request.query.collection,
            pinned = request.pinned,
            live = table.len(),
            "Subscription started"
        );
        Ok(SubscriptionHandle { id: request.id, active })
    }

    /// Evict oldest non-pinned subscriptions until a slot is free.
    fn make_room(&self, table: &mut HashMap<String, LiveSubscription>) -> SyncResult<()> {
        let cap = self.cap.load(Ordering::Relaxed);
        if table.len() < cap {
            return Ok(());
        }
        let required = table.len() + 1 - cap;

        let mut evictable: Vec<(i64, u64, String)> = table
            .iter()
            .filter(|(_, s)| !s.pinned)
            .map(|(id, s)| (s.started_at, s.seq, id.clone()))
            .collect();
        if evictable.len() < required {
            warn!(cap, live = table.len(), "Subscription cap reached, nothing evictable");
            return Err(SyncError::SubscriptionCapReached(cap));
        }
        evictable.sort();

        let batch = required.max(self.eviction_batch.load(Ordering::Relaxed));
        let evicted: Vec<String> = evictable.into_iter().take(batch).map(|(_, _, id)| id).collect();
        for id in &evicted {
            if let Some(sub) = table.remove(id) {
                sub.cancel();
            }
        }
        crate::metrics::record_subscription_evictions(evicted.len());
        info!(count = evicted.len(), ids = ?evicted, "Evicted oldest subscriptions to stay under cap");
        Ok(())
    }

    /// Cancel `id`. No delivery for it begins after this returns.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut table = self.table.lock();
        match table.remove(id) {
            Some(sub) => {
                sub.cancel();
                crate::metrics::set_subscription_count(table.len());
                debug!(subscription = %id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_all(&self) -> usize {
        let mut table = self.table.lock();
        let count = table.len();
        for (_, sub) in table.drain() {
            sub.cancel();
        }
        crate::metrics::set_subscription_count(0);
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_active(&self, id: &str) -> bool {
        self.table.lock().contains_key(id)
    }

    /// Live subscriptions, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        let table = self.table.lock();
        let mut live: Vec<(u64, SubscriptionInfo)> = table
            .iter()
            .map(|(id, s)| {
                (
                    s.seq,
                    SubscriptionInfo {
                        id: id.clone(),
                        collection: s.collection.clone(),
                        started_at: s.started_at,
                        pinned: s.pinned,
                    },
                )
            })
            .collect();
        live.sort_by(|a, b| (a.1.started_at, a.0).cmp(&(b.1.started_at, b.0)));
        live.into_iter().map(|(_, info)| info).collect()
    }

    pub fn set_cap(&self, cap: usize) {
        self.cap.store(cap, Ordering::Relaxed);
    }

    pub fn set_eviction_batch(&self, batch: usize) {
        self.eviction_batch.store(batch, Ordering::Relaxed);
    }

    pub fn set_max_limit(&self, max_limit: usize) {
        self.max_limit.store(max_limit, Ordering::Relaxed);
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for sub in self.table.get_mut().values() {
            sub.cancel();
        }
    }
}

struct Delivery {
    metric_id: String,
    active: Arc<AtomicBool>,
    on_data: DataCallback,
    on_error: Option<ErrorCallback>,
    cache: Arc<TimedCache>,
    metrics: Arc<QueryMetrics>,
    cache_priority: Priority,
}

impl Delivery {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

async fn deliver(delivery: Delivery, mut stream: SnapshotStream) {
    while let Some(message) = stream.recv().await {
        if !delivery.is_active() {
            break;
        }
        let started = Instant::now();
        match message {
            Ok(documents) => {
                for doc in &documents {
                    if let Err(e) = delivery
                        .cache
                        .put_json(&doc.cache_key(), doc, delivery.cache_priority, None)
                        .await
                    {
                        warn!(key = %doc.cache_key(), error = %e, "Failed to cache subscribed document");
                    }
                }
                if !delivery.is_active() {
                    break;
                }
                (delivery.on_data)(&documents);
                let elapsed = started.elapsed();
                delivery.metrics.record_success(&delivery.metric_id, elapsed, documents.len());
                crate::metrics::record_subscription_delivery("success", elapsed);
            }
            Err(e) => {
                if let Some(on_error) = &delivery.on_error {
                    on_error(&e);
                }
                let elapsed = started.elapsed();
                delivery.metrics.record_failure(&delivery.metric_id, elapsed, &e.to_string());
                crate::metrics::record_subscription_delivery("error", elapsed);
            }
        }
    }
    debug!(subscription = %delivery.metric_id, "Snapshot stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::memory::{InMemoryDurableStore, InMemoryRemoteStore};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        remote: Arc<InMemoryRemoteStore>,
        cache: Arc<TimedCache>,
        metrics: Arc<QueryMetrics>,
        clock: ManualClock,
        manager: SubscriptionManager,
    }

    fn fixture(cap: usize, batch: usize) -> Fixture {
        let clock = ManualClock::new(1_000);
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let remote = Arc::new(InMemoryRemoteStore::new(shared.clone()));
        let cache = Arc::new(TimedCache::new(Arc::new(InMemoryDurableStore::new()), shared.clone(), 0));
        let metrics = Arc::new(QueryMetrics::new(shared.clone(), 16, Duration::from_secs(1)));
        let manager = SubscriptionManager::new(
            remote.clone(),
            cache.clone(),
            metrics.clone(),
            shared,
            cap,
            batch,
            100,
            Priority::Medium,
        );
        Fixture {
            remote,
            cache,
            metrics,
            clock,
            manager,
        }
    }

    fn request(id: &str) -> SubscriptionRequest {
        SubscriptionRequest::new(id, Query::collection("vitals"), |_| {})
    }

    fn channel_request(id: &str) -> (SubscriptionRequest, mpsc::UnboundedReceiver<Vec<Document>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let req = SubscriptionRequest::new(id, Query::collection("vitals"), move |docs| {
            let _ = tx.send(docs.to_vec());
        });
        (req, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Vec<Document>>) -> Vec<Document> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_delivers_snapshots_and_feeds_cache() {
        let f = fixture(10, 2);
        let (req, mut rx) = channel_request("feed");
        f.manager.subscribe(req).await.unwrap();

        assert!(next(&mut rx).await.is_empty());
        f.remote.seed(Document::new("vitals", "v1", json!({"bpm": 70})));
        let docs = next(&mut rx).await;
        assert_eq!(docs.len(), 1);

        let cached: Document = f.cache.get_json("doc:vitals/v1").await.unwrap();
        assert_eq!(cached.data, json!({"bpm": 70}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.metrics.get("subscription:feed").unwrap().success_count, 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_deliveries() {
        let f = fixture(10, 2);
        let (req, mut rx) = channel_request("feed");
        let handle = f.manager.subscribe(req).await.unwrap();
        next(&mut rx).await;

        assert!(f.manager.unsubscribe("feed"));
        assert!(!handle.is_active());
        assert!(!f.manager.unsubscribe("feed"));

        f.remote.seed(Document::new("vitals", "v1", json!({})));
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv()).await.map_or(true, |m| m.is_none()));
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_and_try_subscribe_rejects() {
        let f = fixture(10, 2);
        let first = f.manager.subscribe(request("dup")).await.unwrap();
        let second = f.manager.subscribe(request("dup")).await.unwrap();
        assert!(!first.is_active());
        assert!(second.is_active());
        assert_eq!(f.manager.len(), 1);

        let err = f.manager.try_subscribe(request("dup")).await.unwrap_err();
        assert!(matches!(err, SyncError::DuplicateSubscription(id) if id == "dup"));
        assert!(second.is_active());
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest_batch() {
        let f = fixture(4, 2);
        for i in 0..4 {
            f.clock.advance_millis(10);
            f.manager.subscribe(request(&format!("s{}", i))).await.unwrap();
        }
        f.manager.subscribe(request("s4")).await.unwrap();

        let ids: Vec<_> = f.manager.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn test_pinned_survive_and_full_pinned_pool_refuses() {
        let f = fixture(2, 5);
        f.manager.subscribe(request("old-pinned").pinned()).await.unwrap();
        f.clock.advance_millis(1);
        f.manager.subscribe(request("young")).await.unwrap();
        f.clock.advance_millis(1);
        f.manager.subscribe(request("newest")).await.unwrap();

        let ids: Vec<_> = f.manager.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["old-pinned", "newest"]);

        f.manager.unsubscribe("newest");
        f.manager.subscribe(request("pinned-2").pinned()).await.unwrap();
        let err = f.manager.subscribe(request("late")).await.unwrap_err();
        assert!(matches!(err, SyncError::SubscriptionCapReached(2)));
        assert_eq!(f.manager.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_errors_reach_callback_and_metrics() {
        let f = fixture(10, 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let req = SubscriptionRequest::new("feed", Query::collection("vitals"), |_| {}).on_error(move |e| {
            let _ = tx.send(e.clone());
        });
        f.manager.subscribe(req).await.unwrap();

        f.remote.fail_subscriptions("vitals", StorageError::Backend("listener revoked".into()));
        let err = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(err, StorageError::Backend("listener revoked".into()));

        // Metric is recorded right after the callback returns
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.metrics.get("subscription:feed").unwrap().error_count, 1);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let f = fixture(10, 2);
        assert!(matches!(f.manager.subscribe(request("")).await, Err(SyncError::InvalidArgument(_))));
        let bad = SubscriptionRequest::new("x", Query::collection("vitals").limit(0), |_| {});
        assert!(matches!(f.manager.subscribe(bad).await, Err(SyncError::InvalidArgument(_))));
    }
}
