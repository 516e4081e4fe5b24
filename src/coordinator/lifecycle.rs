// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start, shutdown, run loop.
//!
//! This module contains the startup sequence, main run loop, and shutdown logic.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::OfflineSyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::storage::traits::SyncSignal;

use super::{EngineInner, EngineState, MaintenanceReport, StartupReport, SyncEngine};

impl SyncEngine {
    /// Start the engine.
    ///
    /// Startup flow:
    /// 1. Restore the durable cache mirror (expired and malformed entries dropped)
    /// 2. Reload pending mutations in drain order
    /// 3. Restore the last persisted sync status, then correct it against the
    ///    remote's current sync signal
    /// 4. Spawn the run loop (sweep, periodic drain, connectivity, config)
    /// 5. If online with pending mutations, request a drain
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> SyncResult<StartupReport> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(SyncError::invalid(format!("cannot start engine in state {}", state)));
        }
        let startup_start = Instant::now();
        info!("Starting offline sync engine...");
        let inner = &self.inner;
        inner.set_state(EngineState::Loading);

        // ========== PHASE 1: Cache ==========
        let phase_start = Instant::now();
        let cache = match inner.cache.load_from_durable().await {
            Ok(report) => report,
            Err(e) => {
                inner.set_state(EngineState::Created);
                return Err(e);
            }
        };
        crate::metrics::record_startup_phase("cache_load", phase_start.elapsed());

        // ========== PHASE 2: Mutation queue ==========
        let phase_start = Instant::now();
        let pending = match inner.queue.load_from_durable().await {
            Ok(_) => inner.queue.len(),
            Err(e) => {
                inner.set_state(EngineState::Created);
                return Err(e);
            }
        };
        crate::metrics::record_startup_phase("queue_load", phase_start.elapsed());

        // ========== PHASE 3: Status + connectivity ==========
        let status_restored = inner.status.restore().await;
        let sync_rx = inner.remote.sync_state();
        let signal = sync_rx.borrow().clone();
        inner.connectivity.observe(&signal);
        match &signal {
            SyncSignal::Synced => inner.status.came_online(pending).await,
            SyncSignal::ConnectivityError(reason) => {
                inner.status.went_offline(reason).await;
                inner.status.set_pending(pending).await;
            }
        }
        let online = inner.connectivity.is_online();

        // ========== PHASE 4: Background work ==========
        let config_rx = inner.config_rx.lock().take();
        let run = tokio::spawn(run_loop(Arc::clone(inner), config_rx, sync_rx));
        self.tasks.lock().push(run);

        inner.set_state(EngineState::Running);
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        info!(
            restored = cache.restored,
            pending,
            online,
            status_restored,
            "Offline sync engine running"
        );

        if online && pending > 0 {
            inner.request_drain();
        }

        Ok(StartupReport {
            cache_restored: cache.restored,
            cache_expired: cache.expired,
            cache_corrupt: cache.corrupt,
            pending_mutations: pending,
            status_restored,
            online,
        })
    }

    /// Perform one maintenance pass (for manual control instead of the run loop).
    pub async fn tick(&self) -> MaintenanceReport {
        self.inner.maintain().await
    }

    /// Initiate graceful shutdown.
    ///
    /// Pending mutations stay in the durable store and are reloaded by the
    /// next `start()`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        let shutdown_start = Instant::now();
        info!("Initiating offline sync engine shutdown...");
        self.inner.set_state(EngineState::ShuttingDown);

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let cancelled = self.inner.subscriptions.unsubscribe_all();
        self.inner.status.persist().await;

        self.inner.set_state(EngineState::Stopped);
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!(
            cancelled_subscriptions = cancelled,
            pending = self.inner.queue.len(),
            "Offline sync engine shutdown complete"
        );
    }
}

impl EngineInner {
    /// Sweep expired entries, then evict down to the configured budget.
    pub(super) async fn maintain(&self) -> MaintenanceReport {
        let max_bytes = self.config.read().cache_max_bytes;
        let eviction = self.cache.evict_if_over_budget(max_bytes).await;
        MaintenanceReport {
            eviction,
            cache_entries: self.cache.len(),
            cache_bytes: self.cache.size_bytes(),
        }
    }

    /// Apply the live-tunable subset of a new config.
    ///
    /// Timer intervals, fallback policy and cache tiers are read once at start.
    pub(super) fn apply_config(&self, new_config: OfflineSyncConfig) {
        info!(
            cache_max_bytes = new_config.cache_max_bytes,
            max_subscriptions = new_config.max_subscriptions,
            slow_query_threshold_ms = new_config.slow_query_threshold_ms,
            "Config updated"
        );
        self.subscriptions.set_cap(new_config.max_subscriptions);
        self.subscriptions.set_eviction_batch(new_config.subscription_eviction_batch);
        self.subscriptions.set_max_limit(new_config.max_query_limit);
        self.executor.set_max_limit(new_config.max_query_limit);
        self.query_metrics
            .set_slow_threshold(Duration::from_millis(new_config.slow_query_threshold_ms));
        *self.config.write() = new_config;
    }
}

fn every(secs: u64) -> tokio::time::Interval {
    let period = Duration::from_secs(secs.max(1));
    let mut interval = interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Main event loop. Runs until aborted by shutdown.
async fn run_loop(
    inner: Arc<EngineInner>,
    config_rx: Option<watch::Receiver<OfflineSyncConfig>>,
    mut sync_rx: watch::Receiver<SyncSignal>,
) {
    let Some(mut config_rx) = config_rx else {
        warn!("Config receiver already taken, run loop not started");
        return;
    };
    let config = inner.config.read().clone();
    let mut sweep_interval = every(config.cache_sweep_interval_secs);
    let mut drain_interval = every(config.drain_interval_secs);
    let mut probe_interval = every(config.connectivity_probe_interval_secs);
    debug!("Run loop started");

    loop {
        tokio::select! {
            Ok(()) = config_rx.changed() => {
                let new_config = config_rx.borrow_and_update().clone();
                inner.apply_config(new_config);
            }

            Ok(()) = sync_rx.changed() => {
                let signal = sync_rx.borrow_and_update().clone();
                inner.handle_signal(&signal).await;
            }

            _ = sweep_interval.tick() => {
                inner.maintain().await;
            }

            _ = drain_interval.tick() => {
                if inner.connectivity.is_online() {
                    inner.request_drain();
                }
            }

            _ = probe_interval.tick() => {
                let signal = inner.remote.sync_state().borrow().clone();
                inner.handle_signal(&signal).await;
            }
        }
    }
}
