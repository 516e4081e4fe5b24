//! # Offline Sync
//!
//! An offline-first synchronization and caching engine for mobile-style
//! clients of a server-authoritative document database.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Application calls                       │
//! │  • cache_get / cache_put      • execute_query (paginated)  │
//! │  • enqueue_mutation           • subscribe / unsubscribe    │
//! └─────────────────────────────────────────────────────────────┘
//!          │ reads                         │ writes
//!          ▼                               ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │ QueryExecutor            │   │ MutationQueue (durable)       │
//! │  • cache opt-in/fallback │   │  • priority, then enqueue time│
//! │  • limit+1 pagination    │   │  • single-flight drain        │
//! │  • QueryMetrics + alerts │   │  • ConflictResolver           │
//! └──────────────────────────┘   └──────────────────────────────┘
//!          │                               ▲
//!          ▼                               │ drain on Online
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │ TimedCache               │   │ ConnectivityMonitor           │
//! │  • TTL per priority      │   │  • Online ⇄ Offline from the  │
//! │  • Low→Medium eviction   │   │    remote sync signal         │
//! │  • Critical/High durable │   │  • SyncStatus watch stream    │
//! └──────────────────────────┘   └──────────────────────────────┘
//!          ▲
//!          │ snapshots
//! ┌──────────────────────────┐
//! │ SubscriptionManager      │
//! │  • capped, oldest evicted│
//! └──────────────────────────┘
//! ```
//!
//! The engine consumes two collaborators: a [`RemoteStore`] (document CRUD,
//! query, live subscribe, sync signal) and a [`DurableStore`] (opaque blobs
//! by key). In-memory versions of both ship in [`storage`], along with a
//! SQLite-backed durable store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::{OfflineSyncConfig, PendingMutation, Priority, SyncEngine};
//! use offline_sync::query::{Direction, Filter, Query, QueryOptions};
//! use offline_sync::storage::{InMemoryRemoteStore, SqliteDurableStore};
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), offline_sync::SyncError> {
//!     let config = OfflineSyncConfig::default();
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let remote = Arc::new(InMemoryRemoteStore::default());
//!     let durable = Arc::new(SqliteDurableStore::open("./offline_sync.db").await?);
//!
//!     let engine = SyncEngine::new(config, rx, remote, durable);
//!     engine.start().await?;
//!
//!     // Queued durably; replayed when the remote is reachable
//!     engine
//!         .enqueue_mutation(
//!             PendingMutation::create("deliveries", "d1", json!({"status": "pending"}))
//!                 .with_priority(Priority::High),
//!         )
//!         .await?;
//!
//!     let query = Query::collection("deliveries")
//!         .filter(Filter::eq("status", "pending"))
//!         .order_by("due_at", Direction::Asc)
//!         .limit(20);
//!     let page = engine
//!         .execute_paginated_query("pending-deliveries", &query, None, QueryOptions::cached())
//!         .await?;
//!     println!("{} deliveries, more: {}", page.documents.len(), page.has_more);
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncEngine`] context object
//! - [`cache`]: priority-tiered TTL cache
//! - [`queue`]: durable mutation queue and drain
//! - [`conflict`]: server-timestamp-precedence resolution
//! - [`connectivity`]: online/offline state machine
//! - [`query`]: query builder, executor, pagination, metrics
//! - [`subscription`]: capped live subscriptions
//! - [`storage`]: collaborator traits and implementations
//! - [`resilience`]: retry and circuit breaker

pub mod cache;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod coordinator;
pub mod document;
pub mod error;
pub mod metrics;
pub mod priority;
pub mod query;
pub mod queue;
pub mod resilience;
pub mod status;
pub mod storage;
pub mod subscription;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use cache::{CacheStats, EvictionReport, TimedCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OfflineSyncConfig;
pub use conflict::{MissingTimestampPolicy, Resolution};
pub use connectivity::ConnectivityState;
pub use coordinator::{EngineState, MaintenanceReport, StartupReport, SyncEngine};
pub use document::Document;
pub use error::{SyncError, SyncResult};
pub use metrics::LatencyTimer;
pub use priority::Priority;
pub use query::{QueryAlert, QueryMetric, QueryOptions, QueryPage};
pub use queue::{DrainReport, MutationKind, PendingMutation};
pub use resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
pub use resilience::retry::RetryConfig;
pub use status::{SyncPhase, SyncStatus};
pub use storage::traits::{DurableStore, Precondition, RemoteStore, StorageError, SyncSignal};
pub use subscription::{SubscriptionHandle, SubscriptionRequest};
