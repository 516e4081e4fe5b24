// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Online/offline state machine driven by the remote store's sync signal.
//!
//! ```text
//!          ConnectivityError
//!   Online ─────────────────► Offline
//!     ▲                          │
//!     └──────────────────────────┘
//!                Synced
//! ```
//!
//! The monitor only reports transitions; the engine decides what to do with
//! them (update status, request a drain).

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::storage::traits::SyncSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    WentOffline(String),
    CameOnline,
}

pub struct ConnectivityMonitor {
    state: Mutex<ConnectivityState>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Seeded `Online`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectivityState::Online),
        }
    }

    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    /// Feed one signal value. Returns the transition it caused, if any.
    ///
    /// Repeated signals in the same state are absorbed.
    pub fn observe(&self, signal: &SyncSignal) -> Option<Transition> {
        let mut state = self.state.lock();
        let transition = match (*state, signal) {
            (ConnectivityState::Online, SyncSignal::ConnectivityError(reason)) => {
                *state = ConnectivityState::Offline;
                Transition::WentOffline(reason.clone())
            }
            (ConnectivityState::Offline, SyncSignal::Synced) => {
                *state = ConnectivityState::Online;
                Transition::CameOnline
            }
            _ => return None,
        };
        drop(state);

        match &transition {
            Transition::WentOffline(reason) => {
                warn!(reason = %reason, "Connectivity lost");
                crate::metrics::record_connectivity_transition(ConnectivityState::Offline.as_str());
            }
            Transition::CameOnline => {
                info!("Connectivity restored");
                crate::metrics::record_connectivity_transition(ConnectivityState::Online.as_str());
            }
        }
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost() -> SyncSignal {
        SyncSignal::ConnectivityError("dns".into())
    }

    #[test]
    fn test_seeded_online() {
        let monitor = ConnectivityMonitor::new();
        assert!(monitor.is_online());
        assert_eq!(monitor.observe(&SyncSignal::Synced), None);
    }

    #[test]
    fn test_transitions_fire_once() {
        let monitor = ConnectivityMonitor::new();

        assert_eq!(monitor.observe(&lost()), Some(Transition::WentOffline("dns".into())));
        assert_eq!(monitor.observe(&lost()), None);
        assert_eq!(monitor.state(), ConnectivityState::Offline);

        assert_eq!(monitor.observe(&SyncSignal::Synced), Some(Transition::CameOnline));
        assert_eq!(monitor.observe(&SyncSignal::Synced), None);
        assert!(monitor.is_online());
    }
}
