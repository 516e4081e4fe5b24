// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] is the one context object an application holds. It owns
//! and wires together:
//! - the priority-tiered [`TimedCache`]
//! - the durable [`MutationQueue`] and its [`ConflictResolver`]
//! - the [`ConnectivityMonitor`] and [`StatusPublisher`]
//! - the [`QueryExecutor`] and [`SubscriptionManager`]
//!
//! # Lifecycle
//!
//! ```text
//! Created → Loading → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::{EngineState, OfflineSyncConfig, PendingMutation, SyncEngine};
//! use offline_sync::storage::{InMemoryRemoteStore, SqliteDurableStore};
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), offline_sync::SyncError> {
//! let config = OfflineSyncConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let remote = Arc::new(InMemoryRemoteStore::default());
//! let durable = Arc::new(SqliteDurableStore::open("./offline_sync.db").await?);
//!
//! let engine = SyncEngine::new(config, rx, remote, durable);
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await?;
//! engine
//!     .enqueue_mutation(PendingMutation::create("patients", "p1", json!({"name": "Ada"})))
//!     .await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod drain;
mod lifecycle;
mod types;

pub use types::{EngineState, MaintenanceReport, StartupReport};

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::TimedCache;
use crate::clock::{Clock, SystemClock};
use crate::config::OfflineSyncConfig;
use crate::conflict::ConflictResolver;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{SyncError, SyncResult};
use crate::query::{QueryExecutor, QueryMetrics};
use crate::queue::MutationQueue;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::status::StatusPublisher;
use crate::storage::traits::{DurableStore, RemoteStore};
use crate::subscription::SubscriptionManager;

/// Main offline sync coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; every method takes `&self`. Shared state is
/// split into single-writer structures, each behind its own lock, and no lock
/// is held across a remote or durable call.
pub struct SyncEngine {
    pub(super) inner: Arc<EngineInner>,

    /// Run loop, aborted on shutdown
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Shared between the public handle, the run loop and drain tasks.
pub(crate) struct EngineInner {
    /// Configuration (updated at runtime via watch channel)
    pub(super) config: RwLock<OfflineSyncConfig>,

    /// Taken by the run loop at start
    pub(super) config_rx: Mutex<Option<watch::Receiver<OfflineSyncConfig>>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) remote: Arc<dyn RemoteStore>,
    pub(super) cache: Arc<TimedCache>,
    pub(super) queue: MutationQueue,
    pub(super) resolver: ConflictResolver,
    pub(super) status: Arc<StatusPublisher>,
    pub(super) connectivity: ConnectivityMonitor,
    pub(super) query_metrics: Arc<QueryMetrics>,
    pub(super) executor: QueryExecutor,
    pub(super) subscriptions: SubscriptionManager,

    /// Guards remote replay when enabled
    pub(super) breaker: Option<CircuitBreaker>,

    /// A drain was asked for; the active drainer (or a new one) will run it
    pub(super) drain_requested: AtomicBool,
}

impl SyncEngine {
    /// Create a new engine on the system clock.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to restore persisted state and begin background work.
    pub fn new(
        config: OfflineSyncConfig,
        config_rx: watch::Receiver<OfflineSyncConfig>,
        remote: Arc<dyn RemoteStore>,
        durable: Arc<dyn DurableStore>,
    ) -> Self {
        Self::with_clock(config, config_rx, remote, durable, Arc::new(SystemClock))
    }

    /// Create a new engine on an injected clock.
    pub fn with_clock(
        config: OfflineSyncConfig,
        config_rx: watch::Receiver<OfflineSyncConfig>,
        remote: Arc<dyn RemoteStore>,
        durable: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let cache = Arc::new(TimedCache::new(
            durable.clone(),
            clock.clone(),
            config.cache_entry_overhead_bytes,
        ));
        let status = Arc::new(StatusPublisher::new(durable.clone(), clock.clone()));
        let query_metrics = Arc::new(QueryMetrics::new(
            clock.clone(),
            config.alert_channel_capacity,
            Duration::from_millis(config.slow_query_threshold_ms),
        ));

        let inner = EngineInner {
            queue: MutationQueue::new(durable, clock.clone()),
            resolver: ConflictResolver::new(cache.clone(), status.clone(), config.missing_timestamp_policy),
            connectivity: ConnectivityMonitor::new(),
            executor: QueryExecutor::new(
                remote.clone(),
                cache.clone(),
                query_metrics.clone(),
                config.query_fallback,
                config.query_cache_priority,
                config.max_query_limit,
            ),
            subscriptions: SubscriptionManager::new(
                remote.clone(),
                cache.clone(),
                query_metrics.clone(),
                clock,
                config.max_subscriptions,
                config.subscription_eviction_batch,
                config.max_query_limit,
                config.subscription_cache_priority,
            ),
            breaker: config
                .circuit_breaker_enabled
                .then(|| CircuitBreaker::new("remote_replay", CircuitConfig::replay())),
            config: RwLock::new(config),
            config_rx: Mutex::new(Some(config_rx)),
            state: state_tx,
            state_rx,
            remote,
            cache,
            status,
            query_metrics,
            drain_requested: AtomicBool::new(false),
        };

        Self {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.inner.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> OfflineSyncConfig {
        self.inner.config.read().clone()
    }

    /// Data-plane calls are only valid while running.
    pub(super) fn ensure_running(&self) -> SyncResult<()> {
        match self.state() {
            EngineState::Running => Ok(()),
            other => Err(SyncError::NotStarted(other.to_string())),
        }
    }
}

impl EngineInner {
    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::memory::{InMemoryDurableStore, InMemoryRemoteStore};

    fn create_test_engine() -> SyncEngine {
        let config = OfflineSyncConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        SyncEngine::with_clock(
            config,
            rx,
            Arc::new(InMemoryRemoteStore::default()),
            Arc::new(InMemoryDurableStore::new()),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[test]
    fn test_engine_created_state() {
        let engine = create_test_engine();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_data_plane_requires_running() {
        let engine = create_test_engine();
        let err = engine.cache_get("k").await.unwrap_err();
        assert!(matches!(err, SyncError::NotStarted(ref s) if s == "Created"));

        engine.start().await.unwrap();
        assert!(engine.cache_get("k").await.unwrap().is_none());

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(matches!(engine.cache_get("k").await, Err(SyncError::NotStarted(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let engine = create_test_engine();
        engine.start().await.unwrap();
        assert!(matches!(engine.start().await, Err(SyncError::InvalidArgument(_))));
        engine.shutdown().await;
    }

    #[test]
    fn test_circuit_breaker_is_opt_in() {
        assert!(create_test_engine().inner.breaker.is_none());

        let config = OfflineSyncConfig {
            circuit_breaker_enabled: true,
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(config.clone());
        let engine = SyncEngine::new(
            config,
            rx,
            Arc::new(InMemoryRemoteStore::default()),
            Arc::new(InMemoryDurableStore::new()),
        );
        assert_eq!(engine.inner.breaker.as_ref().map(|b| b.name()), Some("remote_replay"));
    }
}
