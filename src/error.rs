// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-facing error taxonomy.
//!
//! Transient I/O failures during replay never reach callers of
//! `enqueue_mutation`; they surface through `SyncStatus`. What does reach
//! callers is either a contract violation (`InvalidArgument`), capability
//! misuse (`NotStarted`, `DuplicateSubscription`), or a collaborator failure
//! on a synchronous read path (`Storage`).

use thiserror::Error;

use crate::storage::traits::StorageError;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Caller broke an operation contract (bad limit, missing payload, foreign cursor)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Data-plane call made before `start()` or after `shutdown()`
    #[error("engine not started (state: {0})")]
    NotStarted(String),

    /// Strict subscribe with an id that is already live
    #[error("subscription '{0}' is already active")]
    DuplicateSubscription(String),

    /// Cap reached and every live subscription is pinned
    #[error("subscription cap of {0} reached and no subscription is evictable")]
    SubscriptionCapReached(usize),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
