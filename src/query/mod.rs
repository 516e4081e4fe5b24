// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query execution: validation, optional cache reuse, pagination, metrics.
//!
//! # Pagination
//!
//! ```text
//! page 1: fetch limit+1 ──► trim to limit ──► next_cursor = token(last doc)
//! page 2: decode token ──► start_after(position) ──► fetch limit+1 ──► ...
//! last:   fetched <= limit ──► next_cursor = None, has_more = false
//! ```
//!
//! Every fetch is timed and recorded in [`QueryMetrics`] under the caller's
//! query id. Contract violations (limit 0, foreign cursor) fail before any
//! fetch and are not recorded.

pub mod builder;
pub mod cursor;
pub mod fetcher;
pub mod metrics;
pub mod value_order;

pub use builder::{Direction, Filter, FilterOp, OrderBy, Query};
pub use cursor::{CursorPosition, PageToken};
pub use fetcher::{PageSource, QueryFallback};
pub use metrics::{QueryAlert, QueryMetric, QueryMetrics};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::cache::TimedCache;
use crate::document::Document;
use crate::error::{SyncError, SyncResult};
use crate::priority::Priority;
use crate::storage::traits::RemoteStore;
use fetcher::{build_fetcher, PageFetcher, PageRequest};
use value_order::position_of;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Serve from the cache when a live copy of this exact page exists
    pub use_cache: bool,
}

impl QueryOptions {
    #[must_use]
    pub fn cached() -> Self {
        Self { use_cache: true }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPage {
    pub documents: Vec<Document>,
    /// Absent when there is no further page
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub source: PageSource,
}

pub struct QueryExecutor {
    fetcher: Box<dyn PageFetcher>,
    cache: Arc<TimedCache>,
    metrics: Arc<QueryMetrics>,
    max_limit: AtomicUsize,
    cache_priority: Priority,
    /// Store every remote page so the cache fallback has something to serve
    cache_pages: bool,
}

impl QueryExecutor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: Arc<TimedCache>,
        metrics: Arc<QueryMetrics>,
        fallback: QueryFallback,
        cache_priority: Priority,
        max_limit: usize,
    ) -> Self {
        Self {
            fetcher: build_fetcher(fallback, remote, cache.clone()),
            cache,
            metrics,
            max_limit: AtomicUsize::new(max_limit),
            cache_priority,
            cache_pages: fallback == QueryFallback::CacheOnError,
        }
    }

    pub fn set_max_limit(&self, max_limit: usize) {
        self.max_limit.store(max_limit, Ordering::Relaxed);
    }

    #[must_use]
    pub fn max_limit(&self) -> usize {
        self.max_limit.load(Ordering::Relaxed)
    }

    /// Run `query` as a single page.
    pub async fn execute(&self, query_id: &str, query: &Query, options: QueryOptions) -> SyncResult<QueryPage> {
        query.validate(self.max_limit())?;
        let key = query.cache_key(None);
        let (documents, source) = self.run(query_id, query, None, &key, options).await?;
        Ok(QueryPage {
            documents,
            next_cursor: None,
            has_more: false,
            source,
        })
    }

    /// Run one page of `query`, resuming after `page_token` if given.
    ///
    /// `query.limit` is the page size and is required.
    pub async fn execute_paginated(
        &self,
        query_id: &str,
        query: &Query,
        page_token: Option<&str>,
        options: QueryOptions,
    ) -> SyncResult<QueryPage> {
        query.validate(self.max_limit())?;
        let limit = query
            .limit
            .ok_or_else(|| SyncError::invalid("paginated query requires a limit"))?;
        let token = page_token.map(PageToken::decode).transpose()?;
        if let Some(token) = &token {
            token.validate_for(query)?;
        }

        let mut widened = query.clone();
        widened.limit = Some(limit + 1);
        let key = query.cache_key(Some(page_token.unwrap_or_default()));
        let start_after = token.as_ref().map(|t| &t.position);

        let (mut documents, source) = self.run(query_id, &widened, start_after, &key, options).await?;
        let has_more = documents.len() > limit;
        documents.truncate(limit);

        let next_cursor = match (has_more, documents.last()) {
            (true, Some(last)) => Some(
                PageToken {
                    collection: query.collection.clone(),
                    position: position_of(last, &query.order_by),
                }
                .encode(),
            ),
            _ => None,
        };
        Ok(QueryPage {
            documents,
            next_cursor,
            has_more,
            source,
        })
    }

    async fn run(
        &self,
        query_id: &str,
        query: &Query,
        start_after: Option<&CursorPosition>,
        key: &str,
        options: QueryOptions,
    ) -> SyncResult<(Vec<Document>, PageSource)> {
        let started = Instant::now();

        if options.use_cache {
            let cached = self.cache.get_json::<Vec<Document>>(key).await;
            crate::metrics::record_query_cache(cached.is_some());
            if let Some(documents) = cached {
                let elapsed = started.elapsed();
                self.metrics.record_success(query_id, elapsed, documents.len());
                crate::metrics::record_query(PageSource::Cache.as_str(), "success", elapsed);
                debug!(query_id, results = documents.len(), "Query served from cache");
                return Ok((documents, PageSource::Cache));
            }
        }

        let request = PageRequest {
            query,
            start_after,
            cache_key: key,
        };
        match self.fetcher.fetch(&request).await {
            Ok(page) => {
                let elapsed = started.elapsed();
                if page.source == PageSource::Remote && (options.use_cache || self.cache_pages) {
                    if let Err(e) = self.cache.put_json(key, &page.documents, self.cache_priority, None).await {
                        warn!(query_id, error = %e, "Failed to cache query page");
                    }
                }
                self.metrics.record_success(query_id, elapsed, page.documents.len());
                crate::metrics::record_query(page.source.as_str(), "success", elapsed);
                debug!(
                    query_id,
                    collection = %query.collection,
                    results = page.documents.len(),
                    source = page.source.as_str(),
                    "Query executed"
                );
                Ok((page.documents, page.source))
            }
            Err(e) => {
                let elapsed = started.elapsed();
                self.metrics.record_failure(query_id, elapsed, &e.to_string());
                crate::metrics::record_query(PageSource::Remote.as_str(), "error", elapsed);
                Err(e.into())
            }
        }
    }
}
