//! Opaque page tokens.
//!
//! A token records the collection and the sort-key values plus id of the last
//! document on the previous page. The remote store resumes with "start after"
//! that position, so pages never overlap or skip regardless of limit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use super::builder::Query;

/// Resume point inside an ordered result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// One value per `order_by` entry, in the same order
    pub sort_values: Vec<Value>,
    pub document_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageToken {
    pub collection: String,
    pub position: CursorPosition,
}

impl PageToken {
    /// Encode as an opaque hex string.
    #[must_use]
    pub fn encode(&self) -> String {
        hex::encode(serde_json::to_vec(self).unwrap_or_default())
    }

    /// Decode a token previously produced by [`encode`](Self::encode).
    pub fn decode(token: &str) -> SyncResult<Self> {
        if token.is_empty() {
            return Err(SyncError::invalid("page token must not be empty"));
        }
        let bytes = hex::decode(token)
            .map_err(|e| SyncError::invalid(format!("malformed page token: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::invalid(format!("malformed page token: {}", e)))
    }

    /// Check the token belongs to `query`.
    pub fn validate_for(&self, query: &Query) -> SyncResult<()> {
        if self.collection != query.collection {
            return Err(SyncError::invalid(format!(
                "page token is for collection '{}', query is for '{}'",
                self.collection, query.collection
            )));
        }
        if self.position.sort_values.len() != query.order_by.len() {
            return Err(SyncError::invalid(format!(
                "page token carries {} sort keys, query orders by {}",
                self.position.sort_values.len(),
                query.order_by.len()
            )));
        }
        Ok(())
    }
}
