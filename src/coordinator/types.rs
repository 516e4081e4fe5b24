//! Public types for the sync engine coordinator.

use crate::cache::EvictionReport;

/// Engine lifecycle state.
///
/// ```text
/// Created → Loading → Running → ShuttingDown → Stopped
/// ```
///
/// Use [`super::SyncEngine::state()`] to check current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Restoring cache, queue and status from the durable store
    Loading,
    /// Accepting calls, background timers active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Shut down; data-plane calls fail with `NotStarted`
    Stopped,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Loading => write!(f, "Loading"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What [`super::SyncEngine::start()`] restored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub cache_restored: usize,
    /// Durable cache entries already past their TTL, dropped
    pub cache_expired: usize,
    /// Malformed durable cache entries, dropped
    pub cache_corrupt: usize,
    pub pending_mutations: usize,
    /// A persisted status from a previous run was found
    pub status_restored: bool,
    pub online: bool,
}

/// Result of one maintenance pass (sweep then budget eviction).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub eviction: EvictionReport,
    pub cache_entries: usize,
    pub cache_bytes: usize,
}
