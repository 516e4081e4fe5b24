// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Drain orchestration: coalescing requests and reacting to connectivity.
//!
//! Anyone may request a drain (enqueue while online, coming back online, the
//! periodic timer). Requests set `drain_requested`; a single drainer task
//! consumes the flag and runs passes until it stays clear. The queue's own
//! single-flight guard still decides who actually drains, so a request that
//! lands mid-pass is picked up by the active drainer once it finishes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::connectivity::Transition;
use crate::queue::{DrainReport, Replayer};
use crate::storage::traits::SyncSignal;

use super::EngineInner;

impl EngineInner {
    /// Ask for a drain. Returns immediately.
    pub(super) fn request_drain(self: &Arc<Self>) {
        self.drain_requested.store(true, Ordering::SeqCst);
        if self.queue.is_draining() {
            debug!("Drain requested while one is running, coalesced");
            return;
        }
        self.spawn_drainer();
    }

    fn spawn_drainer(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.drain_loop().await });
    }

    async fn drain_loop(self: Arc<Self>) {
        while self.drain_requested.swap(false, Ordering::SeqCst) {
            let report = self.drain_pass().await;
            if report.skipped {
                self.drain_requested.store(true, Ordering::SeqCst);
                // The active drainer re-checks the flag after its pass
                if self.queue.is_draining() {
                    return;
                }
            }
        }
    }

    /// One drain pass with status bookkeeping around it.
    pub(super) async fn drain_pass(self: &Arc<Self>) -> DrainReport {
        if !self.queue.is_draining() {
            self.status.drain_started(self.queue.len()).await;
        }

        let replayer = Replayer {
            remote: self.remote.as_ref(),
            resolver: &self.resolver,
            breaker: self.breaker.as_ref(),
        };
        let report = self.queue.drain_once(&replayer).await;
        if report.skipped {
            return report;
        }

        self.status
            .drain_finished(&report, self.queue.len(), self.connectivity.is_online())
            .await;
        if self.drain_requested.load(Ordering::SeqCst) {
            self.spawn_drainer();
        }
        report
    }

    /// Feed a sync signal through the monitor and act on any transition.
    pub(super) async fn handle_signal(self: &Arc<Self>, signal: &SyncSignal) {
        match self.connectivity.observe(signal) {
            Some(Transition::WentOffline(reason)) => {
                self.status.went_offline(&reason).await;
            }
            Some(Transition::CameOnline) => {
                self.status.came_online(self.queue.len()).await;
                self.request_drain();
            }
            None => {}
        }
    }
}
