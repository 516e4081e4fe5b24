// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replaying a single mutation against the remote store.

use tracing::debug;

use super::{MutationKind, PendingMutation, Replayer};
use crate::conflict::Resolution;
use crate::document::Document;
use crate::resilience::circuit_breaker::CircuitError;
use crate::storage::traits::{Precondition, StorageError};

pub(super) enum Outcome {
    Applied,
    Reapplied,
    Discarded,
    Failed(StorageError),
}

pub(super) async fn replay(mutation: &PendingMutation, replayer: &Replayer<'_>) -> Outcome {
    let precondition = Precondition::from(mutation.base_updated_at);
    match guarded_apply(mutation, precondition, replayer).await {
        Ok(written) => {
            write_through(mutation, written.as_ref(), replayer).await;
            Outcome::Applied
        }
        Err(e) if e.is_conflict() => {
            debug!(mutation = %mutation.id, error = %e, "Replay conflicted");
            settle_conflict(mutation, replayer).await
        }
        Err(e) => Outcome::Failed(e),
    }
}

async fn settle_conflict(mutation: &PendingMutation, replayer: &Replayer<'_>) -> Outcome {
    let remote = match replayer.remote.get(&mutation.collection, &mutation.document_id).await {
        Ok(remote) => remote,
        Err(e) => return Outcome::Failed(e),
    };

    match replayer.resolver.adjudicate(mutation, remote.as_ref()).await {
        Resolution::Discard => Outcome::Discarded,
        Resolution::Reapply => {
            // Nothing left to delete
            if mutation.kind == MutationKind::Delete && remote.is_none() {
                write_through(mutation, None, replayer).await;
                return Outcome::Reapplied;
            }
            match guarded_apply(mutation, Precondition::None, replayer).await {
                Ok(written) => {
                    write_through(mutation, written.as_ref(), replayer).await;
                    Outcome::Reapplied
                }
                Err(StorageError::NotFound) if mutation.kind == MutationKind::Update => {
                    recreate(mutation, replayer).await
                }
                Err(e) => Outcome::Failed(e),
            }
        }
    }
}

/// An update whose document vanished comes back as a create of the partial payload.
async fn recreate(mutation: &PendingMutation, replayer: &Replayer<'_>) -> Outcome {
    let payload = mutation.payload.clone().unwrap_or_default();
    match replayer
        .remote
        .create(&mutation.collection, &mutation.document_id, &payload)
        .await
    {
        Ok(doc) => {
            write_through(mutation, Some(&doc), replayer).await;
            Outcome::Reapplied
        }
        Err(e) => Outcome::Failed(e),
    }
}

/// Apply through the circuit breaker when one is configured.
///
/// Conflicts are the server answering normally, so they pass through the
/// breaker as successes.
async fn guarded_apply(
    mutation: &PendingMutation,
    precondition: Precondition,
    replayer: &Replayer<'_>,
) -> Result<Option<Document>, StorageError> {
    let Some(breaker) = replayer.breaker else {
        return apply(mutation, precondition, replayer).await;
    };

    let outcome = breaker
        .call(|| async {
            match apply(mutation, precondition, replayer).await {
                Ok(written) => Ok(Ok(written)),
                Err(e) if e.is_conflict() => Ok(Err(e)),
                Err(e) => Err(e),
            }
        })
        .await;

    match outcome {
        Ok(result) => result,
        Err(CircuitError::Inner(e)) => Err(e),
        Err(CircuitError::Rejected) => Err(StorageError::Unavailable(format!("circuit {} open", breaker.name()))),
    }
}

async fn apply(
    mutation: &PendingMutation,
    precondition: Precondition,
    replayer: &Replayer<'_>,
) -> Result<Option<Document>, StorageError> {
    let remote = replayer.remote;
    let (collection, id) = (mutation.collection.as_str(), mutation.document_id.as_str());
    let payload = mutation.payload.clone().unwrap_or_default();

    match mutation.kind {
        MutationKind::Create => remote.create(collection, id, &payload).await.map(Some),
        MutationKind::Update => remote.update(collection, id, &payload, precondition).await.map(Some),
        MutationKind::Delete => remote.delete(collection, id, precondition).await.map(|()| None),
    }
}

async fn write_through(mutation: &PendingMutation, written: Option<&Document>, replayer: &Replayer<'_>) {
    match written {
        Some(doc) => replayer.resolver.refresh(doc).await,
        None => {
            replayer
                .resolver
                .forget(&mutation.collection, &mutation.document_id)
                .await
        }
    }
}
