//! Remote document data structure.
//!
//! A [`Document`] is the unit the remote store hands back: a JSON body addressed
//! by `(collection, id)`, stamped by the server with `updated_at` (epoch millis).
//! The timestamp drives conflict resolution; documents written by legacy clients
//! may lack it.
//!
//! ```
//! use offline_sync::Document;
//! use serde_json::json;
//!
//! let doc = Document::new("patients", "p1", json!({"name": "Ada", "ward": {"bed": 4}}))
//!     .with_updated_at(1_700_000_000_000);
//!
//! assert_eq!(doc.cache_key(), "doc:patients/p1");
//! assert_eq!(doc.field("ward.bed"), Some(&json!(4)));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pseudo field path that resolves to the document id in filters and orderings.
pub const DOCUMENT_ID_FIELD: &str = "__id__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub data: Value,
    /// Server-managed update timestamp (epoch millis)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl Document {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            data,
            updated_at: None,
        }
    }

    #[must_use]
    pub fn with_updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Key under which this document is mirrored in the timed cache.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.collection, &self.id)
    }

    /// Resolve a dotted field path (`"ward.bed"`) inside `data`.
    ///
    /// `__id__` resolves to nothing here; callers that order or filter by id
    /// compare `self.id` directly.
    pub fn field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.data, |value, segment| value.get(segment))
    }

    /// Shallow-merge `partial` into `data`, the way a remote `update` applies.
    ///
    /// Non-object data is replaced outright.
    pub fn merge(&mut self, partial: &Value) {
        match (&mut self.data, partial) {
            (Value::Object(current), Value::Object(patch)) => {
                for (key, value) in patch {
                    current.insert(key.clone(), value.clone());
                }
            }
            (data, patch) => *data = patch.clone(),
        }
    }

    /// Approximate in-memory footprint, used for cache budgeting.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.collection.len()
            + self.id.len()
            + serde_json::to_vec(&self.data).map(|v| v.len()).unwrap_or(0)
    }
}

/// Cache key for a document address.
#[must_use]
pub fn cache_key(collection: &str, id: &str) -> String {
    format!("doc:{}/{}", collection, id)
}
