//! Configuration for the offline sync engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::OfflineSyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = OfflineSyncConfig::default();
//! assert_eq!(config.cache_max_bytes, 32 * 1024 * 1024); // 32 MB
//! assert_eq!(config.max_subscriptions, 50);
//!
//! // Tuned for a low-memory device
//! let config = OfflineSyncConfig {
//!     cache_max_bytes: 4 * 1024 * 1024,
//!     max_subscriptions: 10,
//!     drain_interval_secs: 60,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

use crate::conflict::MissingTimestampPolicy;
use crate::priority::Priority;
use crate::query::fetcher::QueryFallback;

/// Configuration for the offline sync engine.
///
/// All fields have sensible defaults. Cache budget, subscription cap and the
/// slow-query threshold can be changed at runtime through the config watch
/// channel; the rest are read once at `start()`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OfflineSyncConfig {
    /// In-memory cache budget in bytes (default: 32 MB)
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    /// Fixed per-entry bookkeeping estimate added to key + value length
    #[serde(default = "default_cache_entry_overhead_bytes")]
    pub cache_entry_overhead_bytes: usize,

    /// Eager expiry sweep + eviction interval
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,

    /// Periodic drain interval, independent of connectivity transitions
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,

    /// How often to re-read the remote sync signal when no change was pushed
    #[serde(default = "default_connectivity_probe_interval_secs")]
    pub connectivity_probe_interval_secs: u64,

    /// Live subscription cap
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Minimum subscriptions force-evicted when the cap is hit
    #[serde(default = "default_subscription_eviction_batch")]
    pub subscription_eviction_batch: usize,

    /// Largest accepted query limit; larger limits are rejected, not clamped
    #[serde(default = "default_max_query_limit")]
    pub max_query_limit: usize,

    /// Executions slower than this emit a `QueryAlert::Slow`
    #[serde(default = "default_slow_query_threshold_ms")]
    pub slow_query_threshold_ms: u64,

    /// Alert broadcast buffer; slow receivers lose the oldest alerts
    #[serde(default = "default_alert_channel_capacity")]
    pub alert_channel_capacity: usize,

    /// Tier for cached query pages
    #[serde(default = "default_query_cache_priority")]
    pub query_cache_priority: Priority,

    /// Tier for documents fed into the cache by subscriptions
    #[serde(default = "default_subscription_cache_priority")]
    pub subscription_cache_priority: Priority,

    /// What the resolver does when the server document has no `updated_at`
    #[serde(default)]
    pub missing_timestamp_policy: MissingTimestampPolicy,

    /// Whether queries fall back to cached pages when the remote fails
    #[serde(default)]
    pub query_fallback: QueryFallback,

    /// Guard remote replay with a circuit breaker
    #[serde(default)]
    pub circuit_breaker_enabled: bool,
}

fn default_cache_max_bytes() -> usize { 32 * 1024 * 1024 } // 32 MB
fn default_cache_entry_overhead_bytes() -> usize { 96 }
fn default_cache_sweep_interval_secs() -> u64 { 300 }
fn default_drain_interval_secs() -> u64 { 300 }
fn default_connectivity_probe_interval_secs() -> u64 { 60 }
fn default_max_subscriptions() -> usize { 50 }
fn default_subscription_eviction_batch() -> usize { 5 }
fn default_max_query_limit() -> usize { 1000 }
fn default_slow_query_threshold_ms() -> u64 { 1000 }
fn default_alert_channel_capacity() -> usize { 64 }
fn default_query_cache_priority() -> Priority { Priority::Medium }
fn default_subscription_cache_priority() -> Priority { Priority::Medium }

impl Default for OfflineSyncConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: default_cache_max_bytes(),
            cache_entry_overhead_bytes: default_cache_entry_overhead_bytes(),
            cache_sweep_interval_secs: default_cache_sweep_interval_secs(),
            drain_interval_secs: default_drain_interval_secs(),
            connectivity_probe_interval_secs: default_connectivity_probe_interval_secs(),
            max_subscriptions: default_max_subscriptions(),
            subscription_eviction_batch: default_subscription_eviction_batch(),
            max_query_limit: default_max_query_limit(),
            slow_query_threshold_ms: default_slow_query_threshold_ms(),
            alert_channel_capacity: default_alert_channel_capacity(),
            query_cache_priority: default_query_cache_priority(),
            subscription_cache_priority: default_subscription_cache_priority(),
            missing_timestamp_policy: MissingTimestampPolicy::default(),
            query_fallback: QueryFallback::default(),
            circuit_breaker_enabled: false,
        }
    }
}
