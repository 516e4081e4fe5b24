// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-wide sync status.
//!
//! Held in a `watch` channel: receivers always see the latest status and
//! skip intermediate ones they were too slow to observe. Every change is
//! persisted under [`STATUS_KEY`] so a restart can show the last known phase
//! before any connection is made.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::queue::DrainReport;
use crate::storage::traits::DurableStore;

pub const STATUS_KEY: &str = "sync:status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Synced,
    Syncing,
    Offline,
    Error,
    ConflictResolution,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synced => write!(f, "Synced"),
            Self::Syncing => write!(f, "Syncing"),
            Self::Offline => write!(f, "Offline"),
            Self::Error => write!(f, "Error"),
            Self::ConflictResolution => write!(f, "ConflictResolution"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    /// Epoch millis of the last drain that finished without failures
    pub last_sync_time: Option<i64>,
    pub error_message: Option<String>,
    pub pending_count: usize,
    pub conflict_count: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Synced,
            last_sync_time: None,
            error_message: None,
            pending_count: 0,
            conflict_count: 0,
        }
    }
}

pub struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
    durable: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl StatusPublisher {
    pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self { tx, durable, clock }
    }

    #[must_use]
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Load the last persisted status. A malformed record is dropped.
    pub async fn restore(&self) -> bool {
        let bytes = match self.durable.get(STATUS_KEY).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted sync status");
                crate::metrics::record_durable_error("status_get");
                return false;
            }
        };
        match serde_json::from_slice::<SyncStatus>(&bytes) {
            Ok(status) => {
                debug!(phase = %status.phase, "Restored sync status");
                self.tx.send_replace(status);
                true
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed persisted sync status");
                crate::metrics::record_corruption("status");
                let _ = self.durable.delete(STATUS_KEY).await;
                false
            }
        }
    }

    /// Apply `f`; publish and persist only if the status actually changed.
    pub async fn update(&self, f: impl FnOnce(&mut SyncStatus)) {
        let changed = self.tx.send_if_modified(|status| {
            let before = status.clone();
            f(status);
            *status != before
        });
        if changed {
            self.persist().await;
        }
    }

    /// Write the current status to the durable store.
    pub async fn persist(&self) {
        let snapshot = self.current();
        let bytes = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Failed to encode sync status");
                return;
            }
        };
        if let Err(e) = self.durable.set(STATUS_KEY, &bytes).await {
            warn!(error = %e, "Failed to persist sync status");
            crate::metrics::record_durable_error("status_set");
        }
    }

    pub async fn set_pending(&self, pending: usize) {
        self.update(|s| s.pending_count = pending).await;
    }

    pub async fn went_offline(&self, reason: &str) {
        self.update(|s| {
            s.phase = SyncPhase::Offline;
            s.error_message = Some(reason.to_string());
        })
        .await;
    }

    pub async fn came_online(&self, pending: usize) {
        self.update(|s| {
            s.phase = if pending > 0 { SyncPhase::Syncing } else { SyncPhase::Synced };
            s.error_message = None;
            s.pending_count = pending;
        })
        .await;
    }

    pub async fn drain_started(&self, pending: usize) {
        self.update(|s| {
            if s.phase != SyncPhase::Offline {
                s.phase = SyncPhase::Syncing;
            }
            s.pending_count = pending;
        })
        .await;
    }

    /// A conflict was detected and resolved.
    pub async fn record_conflict(&self) {
        self.update(|s| {
            s.conflict_count += 1;
            if s.phase != SyncPhase::Offline {
                s.phase = SyncPhase::ConflictResolution;
            }
        })
        .await;
    }

    /// Settle the phase after a drain pass.
    ///
    /// Failures while online mean `Error`; while offline the phase stays
    /// `Offline`. A clean pass stamps `last_sync_time`.
    pub async fn drain_finished(&self, report: &DrainReport, pending: usize, online: bool) {
        let now = self.clock.now_millis();
        self.update(|s| {
            s.pending_count = pending;
            if report.failed > 0 {
                s.phase = if online { SyncPhase::Error } else { SyncPhase::Offline };
                s.error_message = report.last_error.clone();
            } else {
                s.last_sync_time = Some(now);
                if online {
                    s.phase = SyncPhase::Synced;
                    s.error_message = None;
                } else {
                    s.phase = SyncPhase::Offline;
                }
            }
        })
        .await;
    }
}
