//! End-to-end sync scenarios against the in-memory source, warehouse and ledger.
//!
//! Run with: cargo test --test sync_scenarios

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use serde_json::json;

use ferry::backend::{MemoryLedger, MemorySource, MemoryWarehouse};
use ferry::credentials::{CredentialProvider, StaticSecretStore};
use ferry::error::ErrorKind;
use ferry::ledger::{Chunking, SyncRecord, SyncStatus};
use ferry::orchestrator::DateRange;
use ferry::pool::{PoolOptions, SourcePool};
use ferry::reconcile::ReconcileMode;
use ferry::schema::{SourceColumn, map_columns};
use ferry::source::SourceTableRef;
use ferry::value::Value;
use ferry::config::SyncType;
use ferry::{OutcomeStatus, SyncOrchestrator, SyncRequest, TableConfig, TableKey};
use ferry_core::RetryPolicy;

const LEASE_TIMEOUT: Duration = Duration::from_secs(2 * 3600);

struct Harness {
    source: MemorySource,
    warehouse: MemoryWarehouse,
    ledger: MemoryLedger,
}

impl Harness {
    fn new() -> Self {
        Self {
            source: MemorySource::new(),
            warehouse: MemoryWarehouse::new(),
            ledger: MemoryLedger::new(),
        }
    }

    fn orchestrator(&self, table: TableConfig) -> SyncOrchestrator {
        let credentials = CredentialProvider::new(Arc::new(StaticSecretStore::new()), Duration::from_secs(60));
        let pool = SourcePool::new(
            Arc::new(self.source.clone()),
            Arc::new(credentials),
            PoolOptions {
                retry: RetryPolicy::none(),
                ..PoolOptions::default()
            },
        );
        SyncOrchestrator::new(
            TableKey::new("orders"),
            table,
            pool,
            Arc::new(self.warehouse.clone()),
            Arc::new(self.ledger.clone()),
            LEASE_TIMEOUT,
        )
    }

    fn staging_tables(&self) -> Vec<String> {
        self.warehouse
            .table_names()
            .into_iter()
            .filter(|name| name.contains("__staging_"))
            .collect()
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn days_ago(n: u64) -> NaiveDate {
    today().checked_sub_days(Days::new(n)).unwrap()
}

fn columns() -> Vec<SourceColumn> {
    vec![
        SourceColumn::new("ID", "NUMBER(38,0)"),
        SourceColumn::new("NAME", "VARCHAR(255)"),
        SourceColumn::new("DAY", "DATE"),
    ]
}

fn row(id: i64, name: &str, day: NaiveDate) -> Vec<Value> {
    vec![Value::Int(id), Value::String(name.into()), Value::Date(day)]
}

/// `count` rows, all dated today.
fn rows_today(count: i64) -> Vec<Vec<Value>> {
    (1..=count).map(|id| row(id, &format!("order-{id}"), today())).collect()
}

fn orders_table() -> TableConfig {
    let mut table = TableConfig::new(SourceTableRef::new("ORDERS").in_schema("SALES"), "orders");
    table.key_columns = vec!["ID".into()];
    table.batch_size = 4;
    table
}

#[tokio::test]
async fn test_small_full_sync_creates_target() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(10));
    let orchestrator = harness.orchestrator(orders_table());

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Success, "{}", outcome.message);
    assert_eq!(outcome.rows_processed, 10);
    assert_eq!(harness.warehouse.created_tables()[0], "orders");
    let rows = harness.warehouse.rows("orders");
    assert_eq!(rows.len(), 10);
    assert_eq!(rows[0]["ID"], json!(1));
    assert_eq!(rows[0]["DAY"], json!(today().format("%Y-%m-%d").to_string()));

    let validation = outcome.validation.expect("validation ran");
    assert_eq!(validation.source_count, 10);
    assert_eq!(validation.target_count, 10);

    assert!(harness.staging_tables().is_empty());
    assert_eq!(harness.warehouse.dropped_tables().len(), 1);

    let records = harness.ledger.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SyncStatus::Completed);
    assert_eq!(records[0].rows_processed, 10);
    assert_eq!(outcome.sync_id.as_deref(), Some(records[0].sync_id.as_str()));
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(7));
    let orchestrator = harness.orchestrator(orders_table());

    orchestrator.run(SyncRequest::default()).await;
    let first = harness.warehouse.rows("orders");
    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(harness.warehouse.rows("orders"), first);
    assert_eq!(harness.ledger.all().len(), 2);
}

#[tokio::test]
async fn test_incremental_sync_updates_and_inserts() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(5));
    let mut table = orders_table();
    table.sync_type = SyncType::Incremental;
    table.incremental_column = Some("DAY".into());
    let orchestrator = harness.orchestrator(table);

    orchestrator.run(SyncRequest::default()).await;

    let mut changed = rows_today(5);
    changed[0] = row(1, "renamed", today());
    changed.push(row(6, "order-6", today()));
    harness.source.set_rows("ORDERS", changed);
    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Success, "{}", outcome.message);
    assert_eq!(outcome.rows_processed, 6);
    let rows = harness.warehouse.rows("orders");
    assert_eq!(rows.len(), 6);
    let first = rows.iter().find(|r| r["ID"] == json!(1)).unwrap();
    assert_eq!(first["NAME"], json!("renamed"));
}

#[tokio::test]
async fn test_incremental_window_excludes_old_rows() {
    let harness = Harness::new();
    harness.source.create_table(
        "ORDERS",
        columns(),
        vec![row(1, "old", days_ago(30)), row(2, "recent", days_ago(2))],
    );
    let mut table = orders_table();
    table.incremental_column = Some("DAY".into());
    let orchestrator = harness.orchestrator(table);

    let request = SyncRequest {
        sync_type: Some(SyncType::Incremental),
        ..SyncRequest::default()
    };
    let outcome = orchestrator.run(request).await;

    assert_eq!(outcome.rows_processed, 1);
    assert_eq!(harness.warehouse.rows("orders")[0]["NAME"], json!("recent"));
}

#[tokio::test]
async fn test_empty_extraction_keeps_target_when_unconfirmed() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), Vec::new());
    harness.warehouse.seed(
        "orders",
        map_columns(&columns()),
        vec![
            [("ID", json!(1)), ("NAME", json!("kept")), ("DAY", json!("2024-01-01"))]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        ],
    );
    let mut table = orders_table();
    table.reconcile = ReconcileMode::Replace;
    table.verify_empty_source = false;
    table.validate = false;
    let orchestrator = harness.orchestrator(table);

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Success, "{}", outcome.message);
    assert_eq!(outcome.rows_processed, 0);
    assert!(outcome.message.contains("skipped replace"), "{}", outcome.message);
    assert_eq!(harness.warehouse.rows("orders").len(), 1);
}

#[tokio::test]
async fn test_confirmed_empty_source_replaces_target() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), Vec::new());
    harness.warehouse.seed(
        "orders",
        map_columns(&columns()),
        vec![
            [("ID", json!(1)), ("NAME", json!("gone")), ("DAY", json!("2024-01-01"))]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        ],
    );
    let mut table = orders_table();
    table.reconcile = ReconcileMode::Replace;
    let orchestrator = harness.orchestrator(table);

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Success, "{}", outcome.message);
    assert!(harness.warehouse.rows("orders").is_empty());
}

#[tokio::test]
async fn test_failed_batch_leaves_target_untouched() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(10));
    let seeded: Vec<_> = [100, 101]
        .into_iter()
        .map(|id| {
            [("ID", json!(id)), ("NAME", json!("existing")), ("DAY", json!("2024-01-01"))]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect()
        })
        .collect();
    harness.warehouse.seed("orders", map_columns(&columns()), seeded.clone());
    harness.warehouse.fail_insert_at(3);

    let mut table = orders_table();
    table.batch_size = 2;
    let orchestrator = harness.orchestrator(table);

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Error);
    assert_eq!(outcome.error_kind, Some(ErrorKind::Staging));
    assert_eq!(harness.warehouse.rows("orders"), seeded);
    assert!(harness.staging_tables().is_empty());
    assert_eq!(harness.warehouse.dropped_tables().len(), 1);

    let records = harness.ledger.all();
    assert_eq!(records[0].status, SyncStatus::Failed);
    assert!(records[0].error_message.is_some());
}

#[tokio::test]
async fn test_staging_is_dropped_when_reconcile_fails() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(3));
    harness.warehouse.fail_merge(true);
    let orchestrator = harness.orchestrator(orders_table());

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.error_kind, Some(ErrorKind::Reconcile));
    assert!(harness.staging_tables().is_empty());
    assert!(harness.warehouse.rows("orders").is_empty());
}

#[tokio::test]
async fn test_null_key_fails_the_sync() {
    let harness = Harness::new();
    harness.source.create_table(
        "ORDERS",
        columns(),
        vec![row(1, "a", today()), vec![Value::Null, Value::String("b".into()), Value::Date(today())]],
    );
    let orchestrator = harness.orchestrator(orders_table());

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert!(outcome.is_error());
    assert!(outcome.message.contains("ID"), "{}", outcome.message);
    assert!(harness.staging_tables().is_empty());
}

#[tokio::test]
async fn test_live_lease_refuses_second_sync() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(3));
    harness.ledger.seed(SyncRecord::begin("orders", None, Utc::now()));
    let orchestrator = harness.orchestrator(orders_table());

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Warning);
    assert_eq!(outcome.message, "sync already in progress");
    assert!(!harness.warehouse.has_table("orders"));
    assert_eq!(harness.source.fetches(), 0);
}

#[tokio::test]
async fn test_stale_lease_is_taken_over() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(3));
    let abandoned = SyncRecord::begin("orders", None, Utc::now() - chrono::Duration::hours(3));
    harness.ledger.seed(abandoned.clone());
    let orchestrator = harness.orchestrator(orders_table());

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Success, "{}", outcome.message);
    let records = harness.ledger.all();
    let old = records.iter().find(|r| r.sync_id == abandoned.sync_id).unwrap();
    assert_eq!(old.status, SyncStatus::Failed);
    assert_eq!(old.error_message.as_deref(), Some("lease expired"));
}

#[tokio::test]
async fn test_cancelled_run_releases_lease() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(3));
    harness.source.set_fetch_delay(Duration::from_millis(500));
    let orchestrator = harness.orchestrator(orders_table());

    let cancelled = tokio::time::timeout(
        Duration::from_millis(100),
        orchestrator.run(SyncRequest::default()),
    )
    .await;
    assert!(cancelled.is_err());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let records = harness.ledger.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, SyncStatus::Failed);
    assert_eq!(records[0].error_message.as_deref(), Some("cancelled"));
    assert!(harness.staging_tables().is_empty());

    let outcome = orchestrator.run(SyncRequest::default()).await;
    assert_eq!(outcome.status, OutcomeStatus::Success, "{}", outcome.message);
    assert_eq!(harness.warehouse.rows("orders").len(), 3);
}

#[tokio::test]
async fn test_concurrent_runs_take_one_lease() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(4));
    harness.source.set_fetch_delay(Duration::from_millis(200));
    let orchestrator = harness.orchestrator(orders_table());

    let (a, b) = tokio::join!(
        orchestrator.run(SyncRequest::default()),
        orchestrator.run(SyncRequest::default())
    );

    let mut statuses = [a.status, b.status];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, [OutcomeStatus::Success, OutcomeStatus::Warning]);
    assert_eq!(harness.warehouse.rows("orders").len(), 4);
}

#[tokio::test]
async fn test_chunked_sync_progresses_to_horizon() {
    let harness = Harness::new();
    let rows = (0..14u64)
        .map(|n| row(i64::try_from(n).unwrap() + 1, "chunked", days_ago(n)))
        .collect();
    harness.source.create_table("ORDERS", columns(), rows);

    let mut table = orders_table();
    table.partition_column = Some("DAY".into());
    table.chunking = Some(Chunking {
        chunk_days: 7,
        initial_lookback_days: 13,
        horizon_days: 0,
    });
    let orchestrator = harness.orchestrator(table);

    let first = orchestrator.run(SyncRequest::default()).await;
    assert_eq!(first.status, OutcomeStatus::Success, "{}", first.message);
    assert_eq!(first.rows_processed, 7);

    let second = orchestrator.run(SyncRequest::default()).await;
    assert_eq!(second.rows_processed, 7);
    assert_eq!(harness.warehouse.rows("orders").len(), 14);

    let third = orchestrator.run(SyncRequest::default()).await;
    assert_eq!(third.status, OutcomeStatus::Success);
    assert_eq!(third.message, "nothing to sync");

    let ranges: Vec<_> = harness
        .ledger
        .all()
        .into_iter()
        .map(|r| (r.range_start, r.range_end))
        .collect();
    assert_eq!(
        ranges,
        vec![
            (Some(days_ago(13)), Some(days_ago(7))),
            (Some(days_ago(6)), Some(today())),
        ]
    );
}

#[tokio::test]
async fn test_failed_chunk_is_retried() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), vec![row(1, "a", days_ago(10))]);
    let mut table = orders_table();
    table.partition_column = Some("DAY".into());
    table.chunking = Some(Chunking {
        chunk_days: 7,
        initial_lookback_days: 13,
        horizon_days: 0,
    });
    let orchestrator = harness.orchestrator(table);

    harness.warehouse.fail_merge(true);
    assert!(orchestrator.run(SyncRequest::default()).await.is_error());
    harness.warehouse.fail_merge(false);
    let retried = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(retried.rows_processed, 1);
    let records = harness.ledger.all();
    assert_eq!(records[0].range_start, records[1].range_start);
    assert_eq!(records[1].status, SyncStatus::Completed);
}

#[tokio::test]
async fn test_time_budget_yields_partial_outcome() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(10));
    harness.source.set_fetch_delay(Duration::from_millis(400));

    let mut table = orders_table();
    table.batch_size = 1;
    table.time_budget_secs = Some(1);
    let orchestrator = harness.orchestrator(table);

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert_eq!(outcome.status, OutcomeStatus::Warning, "{}", outcome.message);
    assert!(outcome.partial);
    assert!(outcome.rows_processed > 0 && outcome.rows_processed < 10);
    assert!(outcome.validation.is_none());
    assert_eq!(harness.warehouse.rows("orders").len() as u64, outcome.rows_processed);
    assert_eq!(harness.ledger.all()[0].status, SyncStatus::Pending);
}

#[tokio::test]
async fn test_partial_replace_keeps_target() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(10));
    harness.source.set_fetch_delay(Duration::from_millis(400));
    harness.warehouse.seed("orders", map_columns(&columns()), Vec::new());

    let mut table = orders_table();
    table.batch_size = 1;
    table.time_budget_secs = Some(1);
    table.reconcile = ReconcileMode::Replace;
    let orchestrator = harness.orchestrator(table);

    let outcome = orchestrator.run(SyncRequest::default()).await;

    assert!(outcome.partial);
    assert!(harness.warehouse.rows("orders").is_empty());
    assert!(harness.staging_tables().is_empty());
}

#[tokio::test]
async fn test_stale_rows_removed_within_range() {
    let harness = Harness::new();
    let rows = vec![
        row(1, "a", days_ago(3)),
        row(2, "b", days_ago(2)),
        row(3, "c", days_ago(1)),
        row(4, "outside", days_ago(20)),
    ];
    harness.source.create_table("ORDERS", columns(), rows.clone());
    let mut table = orders_table();
    table.partition_column = Some("DAY".into());
    table.stale_cleanup = true;
    let orchestrator = harness.orchestrator(table);

    orchestrator.run(SyncRequest::default()).await;
    assert_eq!(harness.warehouse.rows("orders").len(), 4);

    // ID 2 and ID 4 disappear from the source; only ID 2 is inside the range.
    harness
        .source
        .set_rows("ORDERS", vec![rows[0].clone(), rows[2].clone()]);
    let request = SyncRequest {
        date_range: Some(DateRange {
            start: days_ago(5),
            end: today(),
        }),
        ..SyncRequest::default()
    };
    let outcome = orchestrator.run(request).await;

    assert_eq!(outcome.status, OutcomeStatus::Success, "{}", outcome.message);
    let mut ids: Vec<_> = harness
        .warehouse
        .rows("orders")
        .into_iter()
        .map(|r| r["ID"].clone())
        .collect();
    ids.sort_by_key(|v| v.as_i64());
    assert_eq!(ids, vec![json!(1), json!(3), json!(4)]);
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(3));
    let orchestrator = harness.orchestrator(orders_table());

    let outcome = orchestrator
        .run(SyncRequest {
            dry_run: true,
            ..SyncRequest::default()
        })
        .await;

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert!(outcome.message.contains("would be created with 3 columns"), "{}", outcome.message);
    assert!(harness.warehouse.created_tables().is_empty());
    assert!(harness.ledger.all().is_empty());
}

#[tokio::test]
async fn test_dry_run_reports_count_drift() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(10));
    harness.warehouse.seed("orders", map_columns(&columns()), Vec::new());
    let orchestrator = harness.orchestrator(orders_table());

    let outcome = orchestrator
        .run(SyncRequest {
            dry_run: true,
            ..SyncRequest::default()
        })
        .await;

    assert_ne!(outcome.status, OutcomeStatus::Success);
    let validation = outcome.validation.unwrap();
    assert_eq!(validation.source_count, 10);
    assert_eq!(validation.target_count, 0);
}

#[tokio::test]
async fn test_reversed_date_range_is_rejected() {
    let harness = Harness::new();
    harness.source.create_table("ORDERS", columns(), rows_today(1));
    let mut table = orders_table();
    table.partition_column = Some("DAY".into());
    let orchestrator = harness.orchestrator(table);

    let outcome = orchestrator
        .run(SyncRequest {
            date_range: Some(DateRange {
                start: today(),
                end: days_ago(1),
            }),
            ..SyncRequest::default()
        })
        .await;

    assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidRequest));
    assert!(harness.ledger.all().is_empty());
}
