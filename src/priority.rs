// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority tiers shared by the cache and the mutation queue.
//!
//! # Example
//!
//! ```
//! use offline_sync::Priority;
//! use std::time::Duration;
//!
//! assert!(Priority::Critical < Priority::Low); // Critical drains first
//! assert_eq!(Priority::High.default_ttl(), Duration::from_secs(15 * 60));
//! assert!(Priority::High.is_durable());
//! assert!(!Priority::Medium.is_durable());
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ordered priority tier. Declaration order is drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// All tiers, most urgent first.
    pub const ALL: [Priority; 4] = [Self::Critical, Self::High, Self::Medium, Self::Low];

    /// Default time-to-live for cache entries of this tier.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::Critical => Duration::from_secs(5 * 60),
            Self::High => Duration::from_secs(15 * 60),
            Self::Medium => Duration::from_secs(60 * 60),
            Self::Low => Duration::from_secs(6 * 60 * 60),
        }
    }

    /// Whether cache entries of this tier are mirrored to the durable store.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    /// Whether size-based eviction may remove entries of this tier.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        matches!(self, Self::Medium | Self::Low)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
