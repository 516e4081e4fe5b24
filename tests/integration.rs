//! Integration Tests for Offline Sync
//!
//! End-to-end scenarios through the public [`SyncEngine`] API, backed by the
//! in-memory remote store and either the in-memory or SQLite durable store.
//!
//! # Running Tests
//! ```bash
//! cargo test --test integration
//!
//! # Only the restart/recovery scenarios
//! cargo test --test integration restart
//! ```
//!
//! # Logging
//! ```bash
//! RUST_LOG=offline_sync=debug cargo test --test integration -- --nocapture
//! ```
//!
//! # Test Organization
//! - `happy_*` - Normal operation: offline queueing, queries, subscriptions
//! - `restart_*` - Persistence across engine instances
//! - `conflict_*` - Server-timestamp precedence end to end

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use offline_sync::query::{Direction, Filter, Query, QueryOptions};
use offline_sync::storage::{InMemoryDurableStore, InMemoryRemoteStore, RemoteOpKind, SqliteDurableStore};
use offline_sync::{
    Document, DurableStore, EngineState, ManualClock, OfflineSyncConfig, PendingMutation, Priority, SubscriptionRequest,
    SyncEngine, SyncError, SyncPhase, SyncStatus,
};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    engine: SyncEngine,
    remote: Arc<InMemoryRemoteStore>,
    durable: Arc<dyn DurableStore>,
    clock: ManualClock,
    config_tx: watch::Sender<OfflineSyncConfig>,
}

/// Logs go to the test writer; set `RUST_LOG=offline_sync=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness_with(config: OfflineSyncConfig, remote: Arc<InMemoryRemoteStore>, durable: Arc<dyn DurableStore>, clock: ManualClock) -> Harness {
    init_tracing();
    let (config_tx, config_rx) = watch::channel(config.clone());
    let engine = SyncEngine::with_clock(config, config_rx, remote.clone(), durable.clone(), Arc::new(clock.clone()));
    Harness {
        engine,
        remote,
        durable,
        clock,
        config_tx,
    }
}

fn harness(config: OfflineSyncConfig) -> Harness {
    let clock = ManualClock::new(1_000);
    let remote = Arc::new(InMemoryRemoteStore::new(Arc::new(clock.clone())));
    harness_with(config, remote, Arc::new(InMemoryDurableStore::new()), clock)
}

async fn wait_for_status(engine: &SyncEngine, pred: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
    let mut rx = engine.sync_status_stream();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = rx.borrow_and_update().clone();
            if pred(&current) {
                return current;
            }
            rx.changed().await.expect("status channel closed");
        }
    })
    .await
    .expect("timed out waiting for sync status")
}

async fn go_offline(h: &Harness) {
    h.remote.set_online(false);
    wait_for_status(&h.engine, |s| s.phase == SyncPhase::Offline).await;
}

// =============================================================================
// Happy path
// =============================================================================

#[tokio::test]
async fn happy_offline_create_is_applied_once_after_reconnect() {
    let h = harness(OfflineSyncConfig::default());
    h.engine.start().await.unwrap();
    go_offline(&h).await;

    h.engine
        .enqueue_mutation(PendingMutation::create("patients", "p1", json!({"name": "Ada", "ward": "B"})))
        .await
        .unwrap();

    let status = h.engine.sync_status();
    assert_eq!(status.phase, SyncPhase::Offline);
    assert_eq!(status.pending_count, 1);
    assert!(h.remote.operations().is_empty());

    h.remote.set_online(true);
    let status = wait_for_status(&h.engine, |s| s.phase == SyncPhase::Synced && s.pending_count == 0).await;
    assert!(status.last_sync_time.is_some());

    let ops = h.remote.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, RemoteOpKind::Create);
    assert_eq!((ops[0].collection.as_str(), ops[0].id.as_str()), ("patients", "p1"));

    let cached = h.engine.cache_get_document("patients", "p1").await.unwrap().unwrap();
    assert_eq!(cached.data["name"], "Ada");

    h.engine.shutdown().await;
}

#[tokio::test]
async fn happy_online_enqueue_drains_in_background() {
    let h = harness(OfflineSyncConfig::default());
    h.engine.start().await.unwrap();

    for i in 0..5 {
        h.engine
            .enqueue_mutation(PendingMutation::create("deliveries", format!("d{}", i), json!({"n": i})))
            .await
            .unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.remote.len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    wait_for_status(&h.engine, |s| s.pending_count == 0 && s.phase == SyncPhase::Synced).await;
    assert_eq!(h.remote.operations().len(), 5);
    assert!(h.engine.pending_mutations().is_empty());
}

#[tokio::test]
async fn happy_manual_sync_reports_failures_without_erroring() {
    let h = harness(OfflineSyncConfig::default());
    h.engine.start().await.unwrap();
    go_offline(&h).await;
    h.engine
        .enqueue_mutation(PendingMutation::delete("patients", "p9"))
        .await
        .unwrap();

    let report = h.engine.manual_sync().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(h.engine.pending_mutations()[0].attempts, 1);
    let status = h.engine.sync_status();
    assert_eq!(status.phase, SyncPhase::Offline);
    assert_eq!(status.pending_count, 1);
}

#[tokio::test]
async fn happy_paginated_query_and_metrics() {
    let h = harness(OfflineSyncConfig::default());
    for i in 0..10 {
        h.remote.seed(Document::new("deliveries", format!("d{:02}", i), json!({"due": i % 4, "status": "pending"})));
    }
    h.remote.seed(Document::new("deliveries", "done", json!({"due": 0, "status": "delivered"})));
    h.engine.start().await.unwrap();

    let query = Query::collection("deliveries")
        .filter(Filter::eq("status", "pending"))
        .order_by("due", Direction::Desc)
        .limit(4);

    let mut ids = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = h
            .engine
            .execute_paginated_query("pending", &query, cursor.as_deref(), QueryOptions::default())
            .await
            .unwrap();
        ids.extend(page.documents.iter().map(|d| d.id.clone()));
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
    }
    assert_eq!(ids.len(), 10);
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 10);

    let metric = h.engine.query_metric("pending").unwrap();
    assert_eq!(metric.execution_count, 3);
    assert_eq!(metric.error_count, 0);
    assert!((metric.average_result_count - 10.0 / 3.0).abs() < 1e-9);

    let err = h
        .engine
        .execute_query("bad", &query.clone().limit(0), QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidArgument(_)));
    assert!(h.engine.query_metric("bad").is_none());
}

#[tokio::test]
async fn happy_query_falls_back_to_cache_offline() {
    let h = harness(OfflineSyncConfig::default());
    h.remote.seed(Document::new("wards", "w1", json!({"beds": 12})));
    h.engine.start().await.unwrap();

    let query = Query::collection("wards");
    let online = h.engine.execute_query("wards", &query, QueryOptions::default()).await.unwrap();
    go_offline(&h).await;
    let offline = h.engine.execute_query("wards", &query, QueryOptions::default()).await.unwrap();

    assert_eq!(offline.documents, online.documents);
    assert_eq!(offline.source, offline_sync::query::PageSource::Cache);
}

#[tokio::test]
async fn happy_subscription_cap_and_cache_feed() {
    let config = OfflineSyncConfig {
        max_subscriptions: 3,
        subscription_eviction_batch: 2,
        ..Default::default()
    };
    let h = harness(config);
    h.engine.start().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        h.clock.advance_millis(1);
        let request = SubscriptionRequest::new(format!("s{}", i), Query::collection("vitals"), |_| {});
        handles.push(h.engine.subscribe(request).await.unwrap());
        assert!(h.engine.subscription_count() <= 3);
    }
    assert!(!handles[0].is_active());
    assert!(!handles[1].is_active());
    assert!(handles[3].is_active());
    assert_eq!(h.engine.subscription_count(), 2);

    h.remote.seed(Document::new("vitals", "v1", json!({"bpm": 64})));
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if h.engine.cache_get_document("vitals", "v1").await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.engine.shutdown().await;
    assert_eq!(h.engine.subscription_count(), 0);
    assert!(!handles[3].is_active());
}

#[tokio::test]
async fn happy_config_updates_apply_live() {
    let h = harness(OfflineSyncConfig::default());
    h.engine.start().await.unwrap();

    let updated = OfflineSyncConfig {
        max_subscriptions: 1,
        max_query_limit: 5,
        ..Default::default()
    };
    h.config_tx.send(updated).unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.engine.config().max_subscriptions != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let err = h
        .engine
        .execute_query("q", &Query::collection("c").limit(6), QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidArgument(_)));
}

#[tokio::test]
async fn happy_cache_budget_evicts_low_before_critical() {
    let config = OfflineSyncConfig {
        cache_max_bytes: 300,
        cache_entry_overhead_bytes: 0,
        ..Default::default()
    };
    let h = harness(config);
    h.engine.start().await.unwrap();

    h.engine.cache_put("critical", vec![0; 200], Priority::Critical, None).await.unwrap();
    for i in 0..5 {
        h.clock.advance_millis(1);
        h.engine.cache_put(&format!("low{}", i), vec![0; 50], Priority::Low, None).await.unwrap();
    }

    assert!(h.engine.cache_get("critical").await.unwrap().is_some());
    assert!(h.engine.cache_get("low0").await.unwrap().is_none());
    assert!(h.engine.cache_get("low4").await.unwrap().is_some());
    assert!(h.engine.cache_stats().bytes <= 300);

    h.clock.advance(Duration::from_secs(6 * 60));
    let report = h.engine.tick().await;
    assert!(report.eviction.expired >= 1);
    assert!(h.engine.cache_get("critical").await.unwrap().is_none());
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn restart_restores_queue_status_and_durable_cache() {
    let first = harness(OfflineSyncConfig::default());
    first.engine.start().await.unwrap();
    go_offline(&first).await;

    first
        .engine
        .enqueue_mutation(PendingMutation::update("patients", "p1", json!({"ward": "C"})).with_priority(Priority::Critical))
        .await
        .unwrap();
    first.engine.cache_put("profile", b"ada".to_vec(), Priority::High, None).await.unwrap();
    first.engine.cache_put("scratch", b"tmp".to_vec(), Priority::Low, None).await.unwrap();
    first.engine.shutdown().await;
    assert_eq!(first.engine.state(), EngineState::Stopped);

    let second = harness_with(
        OfflineSyncConfig::default(),
        first.remote.clone(),
        first.durable.clone(),
        first.clock.clone(),
    );
    let report = second.engine.start().await.unwrap();
    assert_eq!(report.pending_mutations, 1);
    assert!(report.status_restored);
    assert!(!report.online);
    assert_eq!(second.engine.sync_status().phase, SyncPhase::Offline);
    assert_eq!(second.engine.cache_get("profile").await.unwrap(), Some(b"ada".to_vec()));
    assert_eq!(second.engine.cache_get("scratch").await.unwrap(), None);

    first.remote.seed(Document::new("patients", "p1", json!({"ward": "A"})).with_updated_at(0));
    second.remote.set_online(true);
    wait_for_status(&second.engine, |s| s.pending_count == 0 && s.phase == SyncPhase::Synced).await;
    assert_eq!(second.remote.document("patients", "p1").unwrap().data["ward"], "C");
}

#[tokio::test]
async fn restart_with_sqlite_durable_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");
    let clock = ManualClock::new(1_000);
    let remote = Arc::new(InMemoryRemoteStore::new(Arc::new(clock.clone())));
    remote.set_online(false);

    {
        let durable = Arc::new(SqliteDurableStore::open(&path).await.unwrap());
        let h = harness_with(OfflineSyncConfig::default(), remote.clone(), durable, clock.clone());
        h.engine.start().await.unwrap();
        h.engine
            .enqueue_mutation(PendingMutation::create("patients", "p2", json!({"name": "Grace"})))
            .await
            .unwrap();
        h.engine.shutdown().await;
    }

    let durable = Arc::new(SqliteDurableStore::open(&path).await.unwrap());
    let h = harness_with(OfflineSyncConfig::default(), remote.clone(), durable, clock);
    let report = h.engine.start().await.unwrap();
    assert_eq!(report.pending_mutations, 1);

    remote.set_online(true);
    wait_for_status(&h.engine, |s| s.pending_count == 0).await;
    assert!(remote.document("patients", "p2").is_some());
}

// =============================================================================
// Conflicts
// =============================================================================

#[tokio::test]
async fn conflict_newer_server_write_wins_and_refreshes_cache() {
    let h = harness(OfflineSyncConfig::default());
    h.remote.seed(Document::new("patients", "p1", json!({"ward": "A"})).with_updated_at(500));
    h.engine.start().await.unwrap();
    go_offline(&h).await;

    h.engine
        .enqueue_mutation(PendingMutation::update("patients", "p1", json!({"ward": "B"})).with_base_updated_at(500))
        .await
        .unwrap();
    // Another client writes after our local edit
    h.remote.seed(Document::new("patients", "p1", json!({"ward": "D"})).with_updated_at(2_000));

    h.remote.set_online(true);
    let status = wait_for_status(&h.engine, |s| s.pending_count == 0 && s.phase == SyncPhase::Synced).await;
    assert_eq!(status.conflict_count, 1);

    assert_eq!(h.remote.document("patients", "p1").unwrap().data["ward"], "D");
    assert!(h.remote.operations().is_empty());
    let cached = h.engine.cache_get_document("patients", "p1").await.unwrap().unwrap();
    assert_eq!(cached.data["ward"], "D");
}

#[tokio::test]
async fn conflict_older_server_write_loses_to_client_intent() {
    let h = harness(OfflineSyncConfig::default());
    h.remote.seed(Document::new("patients", "p1", json!({"ward": "A"})).with_updated_at(100));
    h.engine.start().await.unwrap();
    go_offline(&h).await;

    h.engine
        .enqueue_mutation(PendingMutation::update("patients", "p1", json!({"ward": "B"})).with_base_updated_at(50))
        .await
        .unwrap();
    h.remote.set_online(true);
    let status = wait_for_status(&h.engine, |s| s.pending_count == 0 && s.phase == SyncPhase::Synced).await;

    assert_eq!(status.conflict_count, 1);
    assert_eq!(h.remote.document("patients", "p1").unwrap().data["ward"], "B");
}
