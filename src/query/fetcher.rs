// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Page fetch strategies.
//!
//! The executor never talks to the remote store directly; it asks a
//! [`PageFetcher`]. Which one is chosen once, at construction, from
//! [`QueryFallback`]:
//!
//! - `RemoteOnly` → [`RemoteFetcher`]
//! - `CacheOnError` → [`FallbackFetcher`] over `RemoteFetcher` then [`CacheFetcher`]

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::builder::Query;
use super::cursor::CursorPosition;
use crate::cache::TimedCache;
use crate::document::Document;
use crate::storage::traits::{RemoteStore, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFallback {
    /// Remote failures propagate to the caller
    RemoteOnly,
    /// Serve the last cached copy of the same page when the remote fails
    #[default]
    CacheOnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    Remote,
    Cache,
}

impl PageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Cache => "cache",
        }
    }
}

pub struct PageRequest<'a> {
    /// Query as sent to the store (the executor has already widened the limit)
    pub query: &'a Query,
    pub start_after: Option<&'a CursorPosition>,
    /// Where this exact page lives in the cache
    pub cache_key: &'a str,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub documents: Vec<Document>,
    pub source: PageSource,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, request: &PageRequest<'_>) -> Result<FetchedPage, StorageError>;
}

pub struct RemoteFetcher {
    remote: Arc<dyn RemoteStore>,
}

impl RemoteFetcher {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl PageFetcher for RemoteFetcher {
    async fn fetch(&self, request: &PageRequest<'_>) -> Result<FetchedPage, StorageError> {
        let documents = self.remote.query(request.query, request.start_after).await?;
        Ok(FetchedPage {
            documents,
            source: PageSource::Remote,
        })
    }
}

/// Serves pages previously stored by the executor.
pub struct CacheFetcher {
    cache: Arc<TimedCache>,
}

impl CacheFetcher {
    pub fn new(cache: Arc<TimedCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PageFetcher for CacheFetcher {
    async fn fetch(&self, request: &PageRequest<'_>) -> Result<FetchedPage, StorageError> {
        match self.cache.get_json::<Vec<Document>>(request.cache_key).await {
            Some(documents) => Ok(FetchedPage {
                documents,
                source: PageSource::Cache,
            }),
            None => Err(StorageError::Unavailable(format!(
                "no cached page for {}",
                request.cache_key
            ))),
        }
    }
}

/// Primary first; on failure, the fallback. If both fail the primary's error wins.
pub struct FallbackFetcher {
    primary: Box<dyn PageFetcher>,
    fallback: Box<dyn PageFetcher>,
}

impl FallbackFetcher {
    pub fn new(primary: Box<dyn PageFetcher>, fallback: Box<dyn PageFetcher>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl PageFetcher for FallbackFetcher {
    async fn fetch(&self, request: &PageRequest<'_>) -> Result<FetchedPage, StorageError> {
        let primary_err = match self.primary.fetch(request).await {
            Ok(page) => return Ok(page),
            Err(e) => e,
        };
        match self.fallback.fetch(request).await {
            Ok(page) => {
                warn!(
                    collection = %request.query.collection,
                    error = %primary_err,
                    "Primary fetch failed, served from fallback"
                );
                Ok(page)
            }
            Err(fallback_err) => {
                debug!(error = %fallback_err, "Fallback fetch also failed");
                Err(primary_err)
            }
        }
    }
}

/// Compose the fetch chain for `policy`.
pub fn build_fetcher(
    policy: QueryFallback,
    remote: Arc<dyn RemoteStore>,
    cache: Arc<TimedCache>,
) -> Box<dyn PageFetcher> {
    let remote: Box<dyn PageFetcher> = Box::new(RemoteFetcher::new(remote));
    match policy {
        QueryFallback::RemoteOnly => remote,
        QueryFallback::CacheOnError => Box::new(FallbackFetcher::new(remote, Box::new(CacheFetcher::new(cache)))),
    }
}
