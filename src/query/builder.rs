// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query descriptor: collection + filters + orderings + limit.
//!
//! Filters and orderings are kept in the order supplied; the remote store owns
//! index availability, so nothing here checks that an index exists.
//!
//! # Example
//!
//! ```rust
//! use offline_sync::query::{Query, Filter, Direction};
//! use serde_json::json;
//!
//! let query = Query::collection("deliveries")
//!     .filter(Filter::eq("status", "pending"))
//!     .filter(Filter::gte("priority", 2))
//!     .order_by("due_at", Direction::Asc)
//!     .limit(20);
//!
//! assert_eq!(query.filters.len(), 2);
//! assert_eq!(query.limit, Some(20));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::document::{Document, DOCUMENT_ID_FIELD};
use crate::error::{SyncError, SyncResult};
use super::value_order::compare_values;

/// Query over a single collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if `doc` passes every filter.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.collection == self.collection && self.filters.iter().all(|f| f.matches(doc))
    }

    /// Reject malformed queries. Nothing is clamped.
    pub fn validate(&self, max_limit: usize) -> SyncResult<()> {
        if self.collection.is_empty() {
            return Err(SyncError::invalid("collection must not be empty"));
        }
        match self.limit {
            Some(0) => return Err(SyncError::invalid("limit must be >= 1")),
            Some(n) if n > max_limit => {
                return Err(SyncError::invalid(format!(
                    "limit {} exceeds maximum of {}",
                    n, max_limit
                )))
            }
            _ => {}
        }
        for filter in &self.filters {
            if filter.field.is_empty() {
                return Err(SyncError::invalid("filter field must not be empty"));
            }
            if filter.op == FilterOp::In && !filter.value.is_array() {
                return Err(SyncError::invalid(format!(
                    "'in' filter on '{}' requires an array value",
                    filter.field
                )));
            }
        }
        if self.order_by.iter().any(|o| o.field.is_empty()) {
            return Err(SyncError::invalid("order_by field must not be empty"));
        }
        Ok(())
    }

    /// Deterministic cache key over `(collection, filters, orderings, limit)`
    /// plus the resume position, if any.
    ///
    /// Identical logical queries produce identical keys across processes.
    #[must_use]
    pub fn cache_key(&self, cursor: Option<&str>) -> String {
        let canonical = serde_json::json!({
            "c": self.collection,
            "f": self.filters,
            "o": self.order_by,
            "l": self.limit,
            "after": cursor,
        });
        // Value maps are BTreeMap-backed, so this serialization is canonical.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        format!("query:{}", hex::encode(Sha256::digest(&bytes)))
    }
}

/// Single-field predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    /// Dotted field path, or `__id__`
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    ArrayContains,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn not_eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::NotEq, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lte, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOp::In, Value::Array(values))
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::ArrayContains, value)
    }

    /// Evaluate against a document. A missing field never matches.
    pub fn matches(&self, doc: &Document) -> bool {
        let id_value;
        let actual = if self.field == DOCUMENT_ID_FIELD {
            id_value = Value::String(doc.id.clone());
            &id_value
        } else {
            match doc.field(&self.field) {
                Some(v) => v,
                None => return false,
            }
        };

        use std::cmp::Ordering::*;
        match self.op {
            FilterOp::Eq => compare_values(actual, &self.value) == Equal,
            FilterOp::NotEq => compare_values(actual, &self.value) != Equal,
            FilterOp::Lt => same_kind(actual, &self.value) && compare_values(actual, &self.value) == Less,
            FilterOp::Lte => same_kind(actual, &self.value) && compare_values(actual, &self.value) != Greater,
            FilterOp::Gt => same_kind(actual, &self.value) && compare_values(actual, &self.value) == Greater,
            FilterOp::Gte => same_kind(actual, &self.value) && compare_values(actual, &self.value) != Less,
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|vs| vs.iter().any(|v| compare_values(actual, v) == Equal)),
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|vs| vs.iter().any(|v| compare_values(v, &self.value) == Equal)),
        }
    }
}

/// Range comparisons only hold between values of the same JSON kind.
fn same_kind(a: &Value, b: &Value) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Asc,
    Desc,
}
