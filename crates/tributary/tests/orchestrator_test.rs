//! Task runs, retries, scheduling and index lifecycle end to end

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tributary::bulk::{BulkSettings, HealthStatus, IndexAdmin, IndexLifecycle};
use tributary::fetch::{watermark, Strategy};
use tributary::orchestrator::{
    BulkHandle, Orchestrator, OrchestratorSettings, Schedule, TaskDefinition, TaskRegistry,
    TaskRunner,
};
use tributary::planner::ChangeColumns;
use tributary::state::{IndexStateStore, MemoryStateStore, StateTracker};
use tributary::testing::{fetch_settings, row, MemoryIndexServer, RecordingTransport, ScriptedFactory};
use tributary::Error;
use tributary_rdbc::{Row, Value};

fn products() -> Vec<Row> {
    (1..=3)
        .map(|id| {
            row(&[
                ("_id", Value::Int64(id)),
                ("name", Value::from(format!("product {}", id))),
            ])
        })
        .collect()
}

fn bulk_settings() -> BulkSettings {
    BulkSettings {
        flush_interval: Duration::ZERO,
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn quiet() -> OrchestratorSettings {
    OrchestratorSettings {
        concurrency: 2,
        suspension_poll_interval: Duration::ZERO,
        metrics_interval: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_one_shot_run_end_to_end() {
    let server = Arc::new(MemoryIndexServer::new());
    let factory = ScriptedFactory::new(|_, _| Ok(products()));

    let mut def = TaskDefinition::new(
        fetch_settings("products", Strategy::Simple, &["SELECT id AS _id, name FROM products"]),
        "products",
    );
    def.index_settings = Some(json!({"index.refresh_interval": "5s"}));
    def.bulk_mode_tuning = true;
    let registry = TaskRegistry::new();
    registry.register(def);

    let state = StateTracker::new(Arc::new(IndexStateStore::new(server.clone(), "_tributary")));
    let bulk = Arc::new(BulkHandle::new(bulk_settings(), server.clone()));
    let reports = Orchestrator::new(
        quiet(),
        Arc::new(registry),
        Arc::new(factory.clone()),
        state.clone(),
        bulk,
    )
    .with_lifecycle(IndexLifecycle::new(
        server.clone(),
        HealthStatus::Yellow,
        Duration::from_secs(1),
    ))
    .run()
    .await
    .unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].runs, 1);
    assert_eq!(reports[0].failures, 0);

    assert_eq!(server.count("products"), 3);
    assert_eq!(
        server.document("products", "2"),
        Some(json!({"name": "product 2"}))
    );
    assert_eq!(server.refresh_count("products"), 1);
    let settings = server.index_settings("products").await.unwrap();
    assert_eq!(settings["index.refresh_interval"], json!("5s"));
    assert!(settings.get("index.number_of_replicas").is_none());

    let stored = state.load("products", "jdbc").await;
    assert_eq!(stored.counter, 1);
    assert!(!stored.active);
    assert!(stored.last_active_begin.is_some());
    assert!(stored.last_active_end >= stored.last_active_begin);
    assert_eq!(factory.closes(), 1);
}

#[tokio::test]
async fn test_second_run_uses_previous_start_as_watermark() {
    let factory = ScriptedFactory::new(|_, _| Ok(Vec::new()));
    let mut fetch = fetch_settings("orders", Strategy::Column, &["SELECT id AS _id FROM orders"]);
    fetch.columns = ChangeColumns {
        updated: Some("mtime".into()),
        ..Default::default()
    };
    fetch.overlap = Duration::from_secs(30);
    let def = Arc::new(TaskDefinition::new(fetch, "orders"));

    let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
    let bulk = BulkHandle::new(bulk_settings(), Arc::new(RecordingTransport::new()));
    let mut runner = TaskRunner::new(def, Arc::new(factory.clone()), state);
    let cancel = CancellationToken::new();

    let first = runner.run(&bulk, &cancel).await.unwrap();
    let second = runner.run(&bulk, &cancel).await.unwrap();
    assert_eq!(second.state.counter, 2);

    let queries = factory.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(
        queries[0].1,
        vec![Value::DateTimeTz(chrono::DateTime::<chrono::Utc>::UNIX_EPOCH)]
    );
    let expected = watermark(first.state.last_active_begin, Duration::from_secs(30));
    assert_eq!(queries[1].1, vec![Value::DateTimeTz(expected)]);
}

#[tokio::test]
async fn test_connection_error_is_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let factory = ScriptedFactory::new(move |_, _| {
        if counted.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(tributary_rdbc::Error::connection("server closed the connection"))
        } else {
            Ok(products())
        }
    });
    let def = TaskDefinition::new(fetch_settings("products", Strategy::Simple, &["SELECT 1"]), "products")
        .with_retries(2, Duration::from_millis(10));

    let transport = Arc::new(RecordingTransport::new());
    let bulk = BulkHandle::new(bulk_settings(), transport.clone());
    let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
    let mut runner = TaskRunner::new(Arc::new(def), Arc::new(factory.clone()), state.clone());

    let outcome = runner.run(&bulk, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.stats.indexed, 3);
    assert_eq!(transport.batch_sizes(), vec![3]);

    // The failed connection was dropped and a fresh one opened.
    assert_eq!(factory.closes(), 1);
    assert_eq!(factory.connects(), 2);

    // Both attempts counted as runs; only the second one succeeded.
    let stored = state.load("products", "jdbc").await;
    assert_eq!(stored.counter, 2);
    assert!(stored.last_active_begin.is_some());
}

#[tokio::test]
async fn test_config_error_is_not_retried() {
    let factory = ScriptedFactory::new(|_, _| Ok(Vec::new()));
    // Column strategy without any change column
    let def = TaskDefinition::new(fetch_settings("t", Strategy::Column, &["SELECT 1"]), "t")
        .with_retries(5, Duration::from_secs(60));
    let bulk = BulkHandle::new(bulk_settings(), Arc::new(RecordingTransport::new()));
    let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
    let mut runner = TaskRunner::new(Arc::new(def), Arc::new(factory), state);

    let err = runner.run(&bulk, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_interrupted_run_persists_inactive_state() {
    let factory = ScriptedFactory::new(|_, _| Ok(products()));
    let def = TaskDefinition::new(fetch_settings("products", Strategy::Simple, &["SELECT 1"]), "products")
        .with_retries(3, Duration::from_millis(10));
    let bulk = BulkHandle::new(bulk_settings(), Arc::new(RecordingTransport::new()));
    let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
    let mut runner = TaskRunner::new(Arc::new(def), Arc::new(factory.clone()), state.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = runner.run(&bulk, &cancel).await.unwrap_err();
    assert!(err.is_interrupted());

    let stored = state.load("products", "jdbc").await;
    assert_eq!(stored.counter, 1);
    assert!(!stored.active);
    assert!(stored.last_active_begin.is_none());
    assert_eq!(factory.closes(), 1);
}

#[tokio::test]
async fn test_interval_task_runs_until_cancelled() {
    let factory = ScriptedFactory::new(|_, _| Ok(Vec::new()));
    let registry = TaskRegistry::new();
    registry.register(
        TaskDefinition::new(fetch_settings("ticker", Strategy::Simple, &["SELECT 1"]), "ticker")
            .with_schedule(Schedule::Interval(Duration::from_millis(50))),
    );
    let bulk = Arc::new(BulkHandle::new(bulk_settings(), Arc::new(RecordingTransport::new())));
    let group = Orchestrator::new(
        quiet(),
        Arc::new(registry),
        Arc::new(factory),
        StateTracker::new(Arc::new(MemoryStateStore::new())),
        bulk,
    )
    .spawn();

    tokio::time::sleep(Duration::from_millis(300)).await;
    group.cancel();
    let reports = group.join().await.unwrap();

    assert_eq!(reports.len(), 1);
    assert!(reports[0].runs >= 2, "runs: {}", reports[0].runs);
    assert_eq!(reports[0].failures, 0);
}

#[tokio::test]
async fn test_stored_suspension_pauses_bulk_client() {
    let factory = ScriptedFactory::new(|_, _| Ok(Vec::new()));
    let registry = TaskRegistry::new();
    registry.register(
        TaskDefinition::new(fetch_settings("products", Strategy::Simple, &["SELECT 1"]), "products")
            .with_schedule(Schedule::Interval(Duration::from_secs(3600))),
    );
    let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
    let bulk = Arc::new(BulkHandle::new(bulk_settings(), Arc::new(RecordingTransport::new())));
    let group = Orchestrator::new(
        OrchestratorSettings {
            suspension_poll_interval: Duration::from_millis(10),
            ..quiet()
        },
        Arc::new(registry),
        Arc::new(factory),
        state.clone(),
        bulk.clone(),
    )
    .spawn();

    state.set_suspended("products", "jdbc", true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(bulk.client().is_suspended());

    state.set_suspended("products", "jdbc", false).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!bulk.client().is_suspended());

    group.cancel();
    group.join().await.unwrap();
}

#[tokio::test]
async fn test_empty_registry_is_rejected() {
    let bulk = Arc::new(BulkHandle::new(bulk_settings(), Arc::new(RecordingTransport::new())));
    let err = Orchestrator::new(
        quiet(),
        Arc::new(TaskRegistry::new()),
        Arc::new(ScriptedFactory::new(|_, _| Ok(Vec::new()))),
        StateTracker::new(Arc::new(MemoryStateStore::new())),
        bulk,
    )
    .run()
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[tokio::test]
async fn test_unacknowledged_bulk_fails_run_and_keeps_watermark() {
    let factory = ScriptedFactory::new(|_, _| Ok(products()));
    let def = TaskDefinition::new(fetch_settings("products", Strategy::Simple, &["SELECT 1"]), "products")
        .with_retries(0, Duration::from_millis(10));
    let transport = Arc::new(
        RecordingTransport::new()
            .with_delay(Duration::from_millis(300))
            .failing_at(0),
    );
    let bulk = BulkHandle::new(
        BulkSettings {
            flush_interval: Duration::ZERO,
            shutdown_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        transport.clone(),
    );
    let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
    let mut runner = TaskRunner::new(Arc::new(def), Arc::new(factory), state.clone());

    let err = runner.run(&bulk, &CancellationToken::new()).await.unwrap_err();
    assert!(
        matches!(err, Error::DrainTimeout { outstanding: 1, timeout_ms: 50 }),
        "unexpected error: {err}"
    );
    assert!(transport.batches().is_empty());

    let stored = state.load("products", "jdbc").await;
    assert_eq!(stored.counter, 1);
    assert!(!stored.active);
    assert!(stored.last_active_begin.is_none());
}

#[tokio::test]
async fn test_disabled_task_is_skipped() {
    let factory = ScriptedFactory::new(|_, _| Ok(products()));
    let transport = Arc::new(RecordingTransport::new());
    let registry = TaskRegistry::new();
    registry.register(TaskDefinition::new(
        fetch_settings("products", Strategy::Simple, &["SELECT 1"]),
        "products",
    ));
    let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
    state.set_enabled("products", "jdbc", false).await.unwrap();

    let bulk = Arc::new(BulkHandle::new(bulk_settings(), transport.clone()));
    let reports = Orchestrator::new(
        quiet(),
        Arc::new(registry),
        Arc::new(factory.clone()),
        state.clone(),
        bulk,
    )
    .run()
    .await
    .unwrap();

    assert_eq!(reports[0].runs, 0);
    assert_eq!(reports[0].skipped, 1);
    assert_eq!(factory.connects(), 0);
    assert!(transport.batch_sizes().is_empty());
    assert_eq!(state.load("products", "jdbc").await.counter, 0);

    // Enabled again, the next run goes ahead.
    state.set_enabled("products", "jdbc", true).await.unwrap();
    let def = TaskDefinition::new(fetch_settings("products", Strategy::Simple, &["SELECT 1"]), "products");
    let bulk = BulkHandle::new(bulk_settings(), transport.clone());
    let mut runner = TaskRunner::new(Arc::new(def), Arc::new(factory.clone()), state.clone());
    let outcome = runner.run(&bulk, &CancellationToken::new()).await.unwrap();
    assert!(!outcome.skipped);
    assert_eq!(outcome.stats.indexed, 3);
    assert_eq!(outcome.state.counter, 1);
}

#[tokio::test]
async fn test_tasks_sharing_an_index_restore_its_settings() {
    let server = Arc::new(MemoryIndexServer::new());
    server
        .create_index("products", Some(&json!({"index.refresh_interval": "5s"})), None)
        .await
        .unwrap();
    let factory = ScriptedFactory::new(|_, _| Ok(products()));

    let registry = TaskRegistry::new();
    for name in ["products-eu", "products-us"] {
        let mut def = TaskDefinition::new(
            fetch_settings(name, Strategy::Simple, &["SELECT id AS _id, name FROM products"]),
            "products",
        );
        def.bulk_mode_tuning = true;
        registry.register(def);
    }

    let state = StateTracker::new(Arc::new(MemoryStateStore::new()));
    let bulk = Arc::new(BulkHandle::new(bulk_settings(), server.clone()));
    let reports = Orchestrator::new(quiet(), Arc::new(registry), Arc::new(factory), state, bulk)
        .with_lifecycle(IndexLifecycle::new(
            server.clone(),
            HealthStatus::Yellow,
            Duration::from_secs(1),
        ))
        .run()
        .await
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.runs == 1 && r.failures == 0));
    let settings = server.index_settings("products").await.unwrap();
    assert_eq!(settings["index.refresh_interval"], json!("5s"));
    assert!(settings.get("index.number_of_replicas").is_none());
    assert_eq!(server.refresh_count("products"), 2);
}
