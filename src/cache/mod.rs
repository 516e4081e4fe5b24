// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority-tiered TTL cache with a durable mirror.
//!
//! # Tiers
//!
//! ```text
//! Critical  5 min  ┐ mirrored to the durable store on put,
//! High     15 min  ┘ never evicted for size
//! Medium    1 h    ┐ memory only, lost on restart,
//! Low       6 h    ┘ evicted for size (Low first, oldest first)
//! ```
//!
//! Expiry is lazy on `get` and eager on `sweep`. Size eviction always sweeps
//! first so an expired entry never survives while a live one is evicted.
//!
//! The map sits behind one `parking_lot::Mutex`; read-then-write sequences
//! (check expiry then remove, measure then evict) happen under a single lock
//! acquisition. The lock is never held across a durable-store call.

mod entry;

pub use entry::{CacheEntry, CacheStats, EvictionReport, LoadReport};

use entry::PersistedEntry;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use crate::priority::Priority;
use crate::storage::traits::DurableStore;

/// Durable key prefix for mirrored entries.
pub const CACHE_KEY_PREFIX: &str = "cache:";

fn durable_key(key: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, key)
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    bytes: usize,
}

impl CacheState {
    fn insert(&mut self, entry: CacheEntry, overhead: usize) -> Option<CacheEntry> {
        self.bytes += entry.size_bytes(overhead);
        let previous = self.entries.insert(entry.key.clone(), entry);
        if let Some(ref old) = previous {
            self.bytes = self.bytes.saturating_sub(old.size_bytes(overhead));
        }
        previous
    }

    fn remove(&mut self, key: &str, overhead: usize) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(ref old) = removed {
            self.bytes = self.bytes.saturating_sub(old.size_bytes(overhead));
        }
        removed
    }
}

pub struct TimedCache {
    state: Mutex<CacheState>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
    entry_overhead: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

impl TimedCache {
    pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>, entry_overhead: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            durable,
            clock,
            entry_overhead,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Store or replace an entry.
    ///
    /// Critical/High entries are mirrored to the durable store; a failed
    /// mirror write is logged and the in-memory entry kept.
    pub async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        priority: Priority,
        custom_ttl: Option<Duration>,
    ) -> SyncResult<()> {
        if key.is_empty() {
            return Err(SyncError::invalid("cache key must not be empty"));
        }
        if custom_ttl == Some(Duration::ZERO) {
            return Err(SyncError::invalid("custom TTL must be greater than zero"));
        }

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            priority,
            stored_at: self.clock.now_millis(),
            custom_ttl,
        };
        let persisted = priority.is_durable().then(|| PersistedEntry::from_entry(&entry));

        let previous = self.state.lock().insert(entry, self.entry_overhead);

        match persisted {
            Some(record) => {
                let bytes = serde_json::to_vec(&record)?;
                if let Err(e) = self.durable.set(&durable_key(key), &bytes).await {
                    warn!(key, error = %e, "Failed to mirror cache entry to durable store");
                    crate::metrics::record_durable_error("cache_set");
                }
            }
            // Downgraded from a durable tier: drop the stale mirror
            None if previous.as_ref().is_some_and(|p| p.priority.is_durable()) => {
                self.delete_durable(key).await;
            }
            None => {}
        }
        Ok(())
    }

    /// Serialize `value` as JSON and [`put`](Self::put) it.
    pub async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        priority: Priority,
        custom_ttl: Option<Duration>,
    ) -> SyncResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes, priority, custom_ttl).await
    }

    /// Live value for `key`, or `None` if absent or expired.
    ///
    /// An expired entry found here is removed (lazy expiry).
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let now = self.clock.now_millis();
        let expired_durable = {
            let mut state = self.state.lock();
            let live = state
                .entries
                .get(key)
                .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
            match live {
                Some(Some(value)) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache_lookup(true);
                    return Some(value);
                }
                Some(None) => state
                    .remove(key, self.entry_overhead)
                    .is_some_and(|e| e.priority.is_durable()),
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    crate::metrics::record_cache_lookup(false);
                    return None;
                }
            }
        };

        self.expired.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_expired(1);
        crate::metrics::record_cache_lookup(false);
        if expired_durable {
            self.delete_durable(key).await;
        }
        None
    }

    /// [`get`](Self::get) and decode JSON. Undecodable values count as a miss.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Cached value is not the expected shape");
                None
            }
        }
    }

    /// Remove an entry regardless of tier. Returns whether it existed.
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.state.lock().remove(key, self.entry_overhead);
        match removed {
            Some(entry) => {
                if entry.priority.is_durable() {
                    self.delete_durable(key).await;
                }
                true
            }
            None => false,
        }
    }

    /// Drop every entry, in memory and in the durable mirror.
    pub async fn clear(&self) -> SyncResult<()> {
        {
            let mut state = self.state.lock();
            state.entries.clear();
            state.bytes = 0;
        }
        for key in self.durable.keys_with_prefix(CACHE_KEY_PREFIX).await? {
            self.durable.delete(&key).await?;
        }
        Ok(())
    }

    /// Remove every expired entry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let removed: Vec<CacheEntry> = {
            let mut state = self.state.lock();
            let dead: Vec<String> = state
                .entries
                .values()
                .filter(|e| !e.is_live(now))
                .map(|e| e.key.clone())
                .collect();
            dead.iter()
                .filter_map(|k| state.remove(k, self.entry_overhead))
                .collect()
        };

        for entry in removed.iter().filter(|e| e.priority.is_durable()) {
            self.delete_durable(&entry.key).await;
        }
        if !removed.is_empty() {
            self.expired.fetch_add(removed.len() as u64, Ordering::Relaxed);
            crate::metrics::record_cache_expired(removed.len());
            debug!(removed = removed.len(), "Cache sweep removed expired entries");
        }
        removed.len()
    }

    /// Sweep, then evict Low (oldest first) and then Medium entries until the
    /// estimated size is within `max_bytes`. Critical and High are never evicted.
    pub async fn evict_if_over_budget(&self, max_bytes: usize) -> EvictionReport {
        let expired = self.sweep().await;
        let mut report = EvictionReport {
            expired,
            ..Default::default()
        };

        let mut per_tier = [0usize; 4];
        {
            let mut state = self.state.lock();
            if state.bytes > max_bytes {
                let mut victims: Vec<(Priority, i64, String)> = state
                    .entries
                    .values()
                    .filter(|e| e.priority.is_evictable())
                    .map(|e| (e.priority, e.stored_at, e.key.clone()))
                    .collect();
                // Low before Medium, then oldest first
                victims.sort_by(|a, b| (Reverse(a.0), a.1, &a.2).cmp(&(Reverse(b.0), b.1, &b.2)));

                for (priority, _, key) in victims {
                    if state.bytes <= max_bytes {
                        break;
                    }
                    if let Some(entry) = state.remove(&key, self.entry_overhead) {
                        report.evicted += 1;
                        report.evicted_bytes += entry.size_bytes(self.entry_overhead);
                        per_tier[priority.index()] += 1;
                    }
                }
            }
            report.remaining_bytes = state.bytes;
            report.over_budget = state.bytes > max_bytes;
            crate::metrics::set_cache_size(state.entries.len(), state.bytes);
        }

        if report.evicted > 0 {
            self.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
            for priority in Priority::ALL {
                let count = per_tier[priority.index()];
                if count > 0 {
                    crate::metrics::record_cache_eviction(priority, count, report.evicted_bytes);
                }
            }
            debug!(
                evicted = report.evicted,
                evicted_bytes = report.evicted_bytes,
                remaining_bytes = report.remaining_bytes,
                "Cache eviction complete"
            );
        }
        if report.over_budget {
            warn!(
                remaining_bytes = report.remaining_bytes,
                max_bytes,
                "Cache over budget with only Critical/High entries left"
            );
        }
        report
    }

    /// Restore durable entries. Expired ones are deleted, malformed ones dropped.
    pub async fn load_from_durable(&self) -> SyncResult<LoadReport> {
        let now = self.clock.now_millis();
        let mut report = LoadReport::default();

        for durable_key in self.durable.keys_with_prefix(CACHE_KEY_PREFIX).await? {
            let Some(bytes) = self.durable.get(&durable_key).await? else {
                continue;
            };
            let decoded = serde_json::from_slice::<PersistedEntry>(&bytes)
                .map_err(|e| e.to_string())
                .and_then(PersistedEntry::into_entry);

            match decoded {
                Ok(entry) if entry.is_live(now) => {
                    self.state.lock().insert(entry, self.entry_overhead);
                    report.restored += 1;
                }
                Ok(_) => {
                    self.durable.delete(&durable_key).await?;
                    report.expired += 1;
                }
                Err(reason) => {
                    warn!(key = %durable_key, reason, "Dropping malformed cache entry");
                    crate::metrics::record_corruption("cache");
                    self.durable.delete(&durable_key).await?;
                    report.corrupt += 1;
                }
            }
        }

        let (entries, bytes) = {
            let state = self.state.lock();
            (state.entries.len(), state.bytes)
        };
        crate::metrics::set_cache_size(entries, bytes);
        info!(
            restored = report.restored,
            expired = report.expired,
            corrupt = report.corrupt,
            "Cache restored from durable store"
        );
        Ok(report)
    }

    /// Estimated size of all entries in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.state.lock().bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let mut entries_by_priority = [0usize; 4];
        for entry in state.entries.values() {
            entries_by_priority[entry.priority.index()] += 1;
        }
        CacheStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            entries_by_priority,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    async fn delete_durable(&self, key: &str) {
        if let Err(e) = self.durable.delete(&durable_key(key)).await {
            warn!(key, error = %e, "Failed to delete durable cache mirror");
            crate::metrics::record_durable_error("cache_delete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::memory::InMemoryDurableStore;

    const OVERHEAD: usize = 10;

    fn cache() -> (TimedCache, Arc<InMemoryDurableStore>, ManualClock) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let clock = ManualClock::new(1_000_000);
        let cache = TimedCache::new(durable.clone(), Arc::new(clock.clone()), OVERHEAD);
        (cache, durable, clock)
    }

    #[tokio::test]
    async fn test_put_get_and_replace() {
        let (cache, _, _) = cache();
        cache.put("a", b"one".to_vec(), Priority::Medium, None).await.unwrap();
        cache.put("a", b"two".to_vec(), Priority::Medium, None).await.unwrap();

        assert_eq!(cache.get("a").await, Some(b"two".to_vec()));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size_bytes(), 1 + 3 + OVERHEAD);
    }

    #[tokio::test]
    async fn test_lazy_expiry_on_get() {
        let (cache, _, clock) = cache();
        cache.put("a", b"v".to_vec(), Priority::Critical, None).await.unwrap();

        clock.advance(Duration::from_secs(5 * 60) - Duration::from_millis(1));
        assert!(cache.get("a").await.is_some());

        clock.advance_millis(1);
        assert!(cache.get("a").await.is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expired, 1);
    }

    #[tokio::test]
    async fn test_only_durable_tiers_are_mirrored() {
        let (cache, durable, _) = cache();
        cache.put("crit", b"1".to_vec(), Priority::Critical, None).await.unwrap();
        cache.put("high", b"2".to_vec(), Priority::High, None).await.unwrap();
        cache.put("med", b"3".to_vec(), Priority::Medium, None).await.unwrap();
        cache.put("low", b"4".to_vec(), Priority::Low, None).await.unwrap();

        let keys = durable.keys_with_prefix(CACHE_KEY_PREFIX).await.unwrap();
        assert_eq!(keys, ["cache:crit", "cache:high"]);
    }

    #[tokio::test]
    async fn test_downgrade_removes_mirror() {
        let (cache, durable, _) = cache();
        cache.put("k", b"1".to_vec(), Priority::High, None).await.unwrap();
        cache.put("k", b"1".to_vec(), Priority::Low, None).await.unwrap();
        assert!(!durable.contains_key("cache:k"));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_mirrors() {
        let (cache, durable, clock) = cache();
        cache.put("crit", b"1".to_vec(), Priority::Critical, None).await.unwrap();
        cache.put("low", b"2".to_vec(), Priority::Low, None).await.unwrap();

        clock.advance(Duration::from_secs(10 * 60));
        assert_eq!(cache.sweep().await, 1);
        assert!(!durable.contains_key("cache:crit"));
        assert_eq!(cache.get("low").await, Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_eviction_order_low_then_medium_never_high() {
        let (cache, _, clock) = cache();
        // 1-byte key + 1-byte value + overhead = 12 bytes each
        cache.put("h", b"x".to_vec(), Priority::High, None).await.unwrap();
        clock.advance_millis(1);
        cache.put("m", b"x".to_vec(), Priority::Medium, None).await.unwrap();
        clock.advance_millis(1);
        cache.put("o", b"x".to_vec(), Priority::Low, None).await.unwrap();
        clock.advance_millis(1);
        cache.put("n", b"x".to_vec(), Priority::Low, None).await.unwrap();

        let report = cache.evict_if_over_budget(36).await;
        assert_eq!(report.evicted, 1);
        assert!(cache.get("o").await.is_none(), "oldest Low goes first");
        assert!(cache.get("n").await.is_some());

        let report = cache.evict_if_over_budget(12).await;
        assert_eq!(report.evicted, 2);
        assert!(!report.over_budget);
        assert!(cache.get("h").await.is_some());

        let report = cache.evict_if_over_budget(0).await;
        assert_eq!(report.evicted, 0);
        assert!(report.over_budget);
        assert_eq!(cache.stats().count(Priority::High), 1);
    }

    #[tokio::test]
    async fn test_eviction_sweeps_first() {
        let (cache, _, clock) = cache();
        cache.put("old", b"x".to_vec(), Priority::Low, Some(Duration::from_secs(1))).await.unwrap();
        cache.put("new", b"x".to_vec(), Priority::Low, None).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let report = cache.evict_if_over_budget(100).await;
        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted, 0);
    }

    #[tokio::test]
    async fn test_load_restores_live_discards_expired_and_corrupt() {
        let durable = Arc::new(InMemoryDurableStore::new());
        let clock = ManualClock::new(0);
        {
            let writer = TimedCache::new(durable.clone(), Arc::new(clock.clone()), OVERHEAD);
            writer.put("crit", b"1".to_vec(), Priority::Critical, None).await.unwrap();
            clock.advance(Duration::from_secs(4 * 60));
            writer.put("high", b"2".to_vec(), Priority::High, None).await.unwrap();
            writer.put("medium", b"3".to_vec(), Priority::Medium, None).await.unwrap();
        }
        durable.set("cache:broken", b"not json").await.unwrap();
        clock.advance(Duration::from_secs(2 * 60));

        let reader = TimedCache::new(durable.clone(), Arc::new(clock.clone()), OVERHEAD);
        let report = reader.load_from_durable().await.unwrap();

        assert_eq!(report, LoadReport { restored: 1, expired: 1, corrupt: 1 });
        assert_eq!(reader.get("high").await, Some(b"2".to_vec()));
        assert!(reader.get("medium").await.is_none());
        assert!(!durable.contains_key("cache:broken"));
        assert!(!durable.contains_key("cache:crit"));
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() {
        let (cache, _, _) = cache();
        assert!(cache.put("", vec![], Priority::Low, None).await.is_err());
        assert!(cache.put("k", vec![], Priority::Low, Some(Duration::ZERO)).await.is_err());
    }

    #[tokio::test]
    async fn test_json_helpers_and_clear() {
        let (cache, durable, _) = cache();
        cache.put_json("doc", &serde_json::json!({"a": 1}), Priority::High, None).await.unwrap();
        let value: serde_json::Value = cache.get_json("doc").await.unwrap();
        assert_eq!(value["a"], 1);

        cache.clear().await.unwrap();
        assert!(cache.is_empty());
        assert!(durable.is_empty());
    }
}
