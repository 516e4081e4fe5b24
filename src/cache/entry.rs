//! Cache entry, its durable encoding, and observability snapshots.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::priority::Priority;

/// One cached value. At most one entry exists per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub priority: Priority,
    /// Epoch millis when stored (or last replaced)
    pub stored_at: i64,
    pub custom_ttl: Option<Duration>,
}

impl CacheEntry {
    /// Effective TTL: the custom one if set, else the tier default.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.custom_ttl.unwrap_or_else(|| self.priority.default_ttl())
    }

    /// Live iff `now - stored_at < ttl`.
    #[must_use]
    pub fn is_live(&self, now: i64) -> bool {
        let ttl_ms = i64::try_from(self.ttl().as_millis()).unwrap_or(i64::MAX);
        now.saturating_sub(self.stored_at) < ttl_ms
    }

    /// Budget estimate: key + value + fixed overhead.
    #[must_use]
    pub fn size_bytes(&self, overhead: usize) -> usize {
        self.key.len() + self.value.len() + overhead
    }
}

/// Durable representation. The blob is hex-encoded so the JSON stays compact.
#[derive(Serialize, Deserialize)]
pub(super) struct PersistedEntry {
    key: String,
    value: String,
    priority: Priority,
    stored_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    custom_ttl_ms: Option<u64>,
}

impl PersistedEntry {
    pub(super) fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            value: hex::encode(&entry.value),
            priority: entry.priority,
            stored_at: entry.stored_at,
            custom_ttl_ms: entry.custom_ttl.map(|d| d.as_millis() as u64),
        }
    }

    pub(super) fn into_entry(self) -> Result<CacheEntry, String> {
        let value = hex::decode(&self.value).map_err(|e| e.to_string())?;
        Ok(CacheEntry {
            key: self.key,
            value,
            priority: self.priority,
            stored_at: self.stored_at,
            custom_ttl: self.custom_ttl_ms.map(Duration::from_millis),
        })
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    /// Entry count per tier, indexed Critical, High, Medium, Low
    pub entries_by_priority: [usize; 4],
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub evicted: u64,
}

impl CacheStats {
    #[must_use]
    pub fn count(&self, priority: Priority) -> usize {
        self.entries_by_priority[priority.index()]
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of [`TimedCache::evict_if_over_budget`](super::TimedCache::evict_if_over_budget).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Removed by the preceding sweep
    pub expired: usize,
    /// Removed for size
    pub evicted: usize,
    pub evicted_bytes: usize,
    pub remaining_bytes: usize,
    /// Still over budget: only Critical/High entries remain
    pub over_budget: bool,
}

/// Outcome of loading the durable mirror at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub restored: usize,
    pub expired: usize,
    pub corrupt: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(priority: Priority, custom_ttl: Option<Duration>) -> CacheEntry {
        CacheEntry {
            key: "k".into(),
            value: vec![1, 2, 3],
            priority,
            stored_at: 1_000,
            custom_ttl,
        }
    }

    #[test]
    fn test_liveness_boundary() {
        let e = entry(Priority::Critical, None);
        let ttl = 5 * 60 * 1000;
        assert!(e.is_live(1_000 + ttl - 1));
        assert!(!e.is_live(1_000 + ttl));
    }

    #[test]
    fn test_custom_ttl_overrides_tier() {
        let e = entry(Priority::Low, Some(Duration::from_millis(10)));
        assert!(e.is_live(1_009));
        assert!(!e.is_live(1_010));
    }

    #[test]
    fn test_persisted_round_trip() {
        let e = entry(Priority::High, Some(Duration::from_secs(30)));
        let restored = PersistedEntry::from_entry(&e).into_entry().unwrap();
        assert_eq!(restored, e);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats { hits: 3, misses: 1, ..Default::default() };
        assert!((stats.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
