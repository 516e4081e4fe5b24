//! Application-facing API.
//!
//! - Cache: `cache_get`, `cache_put`, `cache_remove`, `cache_get_document`
//! - Writes: `enqueue_mutation`, `manual_sync`
//! - Reads: `execute_query`, `execute_paginated_query`
//! - Live data: `subscribe`, `try_subscribe`, `unsubscribe`
//! - Observability: `sync_status_stream`, `cache_stats`, `query_metrics`, `alerts`
//!
//! Data-plane calls fail with `NotStarted` outside the `Running` state.
//! Observability snapshots are always available.

use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::cache::CacheStats;
use crate::document::{cache_key, Document};
use crate::error::SyncResult;
use crate::priority::Priority;
use crate::query::{Query, QueryAlert, QueryMetric, QueryOptions, QueryPage};
use crate::queue::{DrainReport, PendingMutation};
use crate::status::SyncStatus;
use crate::subscription::{SubscriptionHandle, SubscriptionInfo, SubscriptionRequest};

use super::SyncEngine;

impl SyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Cache
    // ═══════════════════════════════════════════════════════════════════════════

    /// Live cached value for `key`, or `None` if absent or expired.
    pub async fn cache_get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        self.ensure_running()?;
        Ok(self.inner.cache.get(key).await)
    }

    /// Store or replace a cached value, then enforce the byte budget.
    ///
    /// Only Critical/High entries survive a restart.
    pub async fn cache_put(
        &self,
        key: &str,
        value: Vec<u8>,
        priority: Priority,
        custom_ttl: Option<Duration>,
    ) -> SyncResult<()> {
        self.ensure_running()?;
        self.inner.cache.put(key, value, priority, custom_ttl).await?;
        if self.inner.cache.size_bytes() > self.inner.config.read().cache_max_bytes {
            self.inner.maintain().await;
        }
        Ok(())
    }

    /// Explicit removal; the only way Critical/High entries leave early.
    pub async fn cache_remove(&self, key: &str) -> SyncResult<bool> {
        self.ensure_running()?;
        Ok(self.inner.cache.remove(key).await)
    }

    /// Cached copy of a document, as last written through or delivered.
    pub async fn cache_get_document(&self, collection: &str, id: &str) -> SyncResult<Option<Document>> {
        self.ensure_running()?;
        Ok(self.inner.cache.get_json(&cache_key(collection, id)).await)
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Mutations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Durably queue a local write.
    ///
    /// Returns once the mutation is persisted, whatever the network state. If
    /// online, a drain is requested in the background; replay failures never
    /// surface here, only through [`sync_status_stream`](Self::sync_status_stream).
    #[tracing::instrument(skip(self, mutation), fields(collection = %mutation.collection, document = %mutation.document_id))]
    pub async fn enqueue_mutation(&self, mutation: PendingMutation) -> SyncResult<PendingMutation> {
        self.ensure_running()?;
        let stored = self.inner.queue.enqueue(mutation).await?;
        self.inner.status.set_pending(self.inner.queue.len()).await;
        if self.inner.connectivity.is_online() {
            self.inner.request_drain();
        }
        Ok(stored)
    }

    /// Drain now, regardless of timers or connectivity.
    ///
    /// If a drain is already running the returned report is `skipped` and a
    /// follow-up pass is queued behind it.
    #[tracing::instrument(skip(self))]
    pub async fn manual_sync(&self) -> SyncResult<DrainReport> {
        self.ensure_running()?;
        let report = self.inner.drain_pass().await;
        if report.skipped {
            debug!("Manual sync coalesced into running drain");
            self.inner.request_drain();
        }
        Ok(report)
    }

    /// Queued mutations in drain order.
    #[must_use]
    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.inner.queue.snapshot()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Queries
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn execute_query(&self, query_id: &str, query: &Query, options: QueryOptions) -> SyncResult<QueryPage> {
        self.ensure_running()?;
        self.inner.executor.execute(query_id, query, options).await
    }

    /// One page of `query`; pass the previous page's `next_cursor` to continue.
    pub async fn execute_paginated_query(
        &self,
        query_id: &str,
        query: &Query,
        page_token: Option<&str>,
        options: QueryOptions,
    ) -> SyncResult<QueryPage> {
        self.ensure_running()?;
        self.inner
            .executor
            .execute_paginated(query_id, query, page_token, options)
            .await
    }

    /// Per-query metrics, sorted by query id.
    #[must_use]
    pub fn query_metrics(&self) -> Vec<QueryMetric> {
        self.inner.query_metrics.snapshot()
    }

    #[must_use]
    pub fn query_metric(&self, query_id: &str) -> Option<QueryMetric> {
        self.inner.query_metrics.get(query_id)
    }

    pub fn reset_query_metrics(&self) {
        self.inner.query_metrics.reset();
    }

    /// Slow/failed query and delivery alerts. Lagging receivers lose the oldest.
    #[must_use]
    pub fn alerts(&self) -> broadcast::Receiver<QueryAlert> {
        self.inner.query_metrics.subscribe_alerts()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Subscriptions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Subscribe, replacing any live subscription with the same id.
    pub async fn subscribe(&self, request: SubscriptionRequest) -> SyncResult<SubscriptionHandle> {
        self.ensure_running()?;
        self.inner.subscriptions.subscribe(request).await
    }

    /// Subscribe, failing with `DuplicateSubscription` if the id is live.
    pub async fn try_subscribe(&self, request: SubscriptionRequest) -> SyncResult<SubscriptionHandle> {
        self.ensure_running()?;
        self.inner.subscriptions.try_subscribe(request).await
    }

    /// Returns false if `id` was not live.
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.subscriptions.unsubscribe(id)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.subscriptions.list()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Status
    // ═══════════════════════════════════════════════════════════════════════════

    /// Pushes every status change. Slow receivers see only the latest.
    #[must_use]
    pub fn sync_status_stream(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    #[must_use]
    pub fn sync_status(&self) -> SyncStatus {
        self.inner.status.current()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.connectivity.is_online()
    }
}
