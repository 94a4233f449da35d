//! Monitoring passes against an in-memory warehouse and a stub HTTP endpoint
//! standing in for both the engine's trigger route and the alert webhook.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{Days, Duration as ChronoDuration, Utc};
use serde_json::{Value as JsonValue, json};
use tokio::net::TcpListener;

use ferry::backend::{MemoryLedger, MemoryWarehouse};
use ferry::Warehouse;
use ferry::config::TableKey;
use ferry::ledger::{SyncRecord, SyncStatus};
use ferry::schema::{ColumnDef, ColumnType, TableSchema};
use ferry::value::Record;
use ferry_monitor::config::{FallbackConfig, OrchestrationConfig};
use ferry_monitor::{
    FallbackClient, HealthMonitor, HealthStatus, MonitoredTable, Severity, WebhookAlertSink,
};

#[derive(Clone, Default)]
struct Received {
    triggers: Arc<Mutex<Vec<(String, JsonValue)>>>,
    alerts: Arc<Mutex<Vec<JsonValue>>>,
}

impl Received {
    fn triggers(&self) -> Vec<(String, JsonValue)> {
        self.triggers.lock().unwrap().clone()
    }

    fn alerts(&self) -> Vec<JsonValue> {
        self.alerts.lock().unwrap().clone()
    }
}

async fn accept_trigger(
    State(received): State<Received>,
    Path(table): Path<String>,
    Json(body): Json<JsonValue>,
) -> (StatusCode, Json<JsonValue>) {
    let refused = table == "broken";
    received.triggers.lock().unwrap().push((table, body));
    if refused {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "down"})))
    } else {
        (StatusCode::ACCEPTED, Json(json!({"status": "accepted"})))
    }
}

async fn accept_alert(State(received): State<Received>, Json(body): Json<JsonValue>) -> StatusCode {
    received.alerts.lock().unwrap().push(body);
    StatusCode::OK
}

/// Stub server on an ephemeral port.
async fn stub_server() -> (String, Received) {
    let received = Received::default();
    let app = Router::new()
        .route("/sync/{table}", post(accept_trigger))
        .route("/alerts", post(accept_alert))
        .with_state(received.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (base, received)
}

fn days_ago(n: u64) -> String {
    (Utc::now().date_naive() - Days::new(n)).to_string()
}

/// Seed a table whose newest row is `age_days` old.
fn seed(warehouse: &MemoryWarehouse, table: &str, age_days: u64, rows: usize) {
    let schema = TableSchema::new(vec![
        ColumnDef {
            name: "ID".into(),
            column_type: ColumnType::Int64,
            nullable: false,
        },
        ColumnDef {
            name: "DAY".into(),
            column_type: ColumnType::Date,
            nullable: true,
        },
    ]);
    let records: Vec<Record> = (0..rows)
        .map(|i| {
            let mut record = Record::new();
            record.insert("ID".into(), json!(i));
            record.insert("DAY".into(), json!(days_ago(age_days + i as u64)));
            record
        })
        .collect();
    warehouse.seed(table, schema, records);
}

/// A sync of `pipeline` that ended `hours_ago`.
fn finished(pipeline: &str, status: SyncStatus, hours_ago: i64) -> SyncRecord {
    let at = Utc::now() - ChronoDuration::hours(hours_ago);
    let mut record = SyncRecord::begin(pipeline, None, at - ChronoDuration::minutes(5));
    match status {
        SyncStatus::Failed => record.fail(format!("source timeout {hours_ago}h ago"), 0, at),
        _ => record.finish(status, 10, at),
    }
    record
}

fn monitored(target: &str, base: &str, key: &str) -> MonitoredTable {
    let mut table = MonitoredTable::new(target, "DAY");
    table.fallback = Some(FallbackConfig {
        url: format!("{base}/sync/{key}"),
    });
    table
}

fn monitor(
    warehouse: &MemoryWarehouse,
    ledger: &MemoryLedger,
    base: &str,
    tables: Vec<(&str, MonitoredTable)>,
) -> HealthMonitor {
    let client = reqwest::Client::new();
    let start = HealthMonitor::new(
        Arc::new(warehouse.clone()),
        Arc::new(ledger.clone()),
        Duration::from_secs(7200),
        FallbackClient::new(client.clone(), Duration::from_secs(5)),
        Arc::new(WebhookAlertSink::new(client, format!("{base}/alerts"))),
    );
    tables
        .into_iter()
        .fold(start, |m, (key, table)| m.with_table(TableKey::new(key), table))
}

#[tokio::test]
async fn test_healthy_tables_send_only_a_summary() {
    let (base, received) = stub_server().await;
    let warehouse = MemoryWarehouse::new();
    seed(&warehouse, "ORDERS", 0, 3);

    let report = monitor(
        &warehouse,
        &MemoryLedger::new(),
        &base,
        vec![("orders", monitored("ORDERS", &base, "orders"))],
    )
    .check()
    .await;

    assert_eq!(report.tables_checked, 1);
    assert_eq!(report.severity(), Severity::Info);
    assert_eq!(report.details["orders"].status, HealthStatus::Ok);
    assert_eq!(report.details["orders"].row_count, Some(3));
    assert!(received.triggers().is_empty());

    let alerts = received.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["severity"], "INFO");
    assert!(alerts[0]["message"].as_str().unwrap().contains("all tables healthy"));
}

#[tokio::test]
async fn test_stale_table_requests_fallback() {
    let (base, received) = stub_server().await;
    let warehouse = MemoryWarehouse::new();
    seed(&warehouse, "ORDERS", 5, 2);
    seed(&warehouse, "EVENTS", 2, 2);

    let report = monitor(
        &warehouse,
        &MemoryLedger::new(),
        &base,
        vec![
            ("orders", monitored("ORDERS", &base, "orders")),
            ("events", monitored("EVENTS", &base, "events")),
        ],
    )
    .check()
    .await;

    assert_eq!(report.critical, 1);
    assert_eq!(report.warnings, 1);
    assert_eq!(report.details["orders"].days_behind, Some(5));
    assert_eq!(report.details["events"].status, HealthStatus::Warning);
    assert_eq!(report.actions_taken, vec!["Triggered fallback sync for orders"]);

    let triggers = received.triggers();
    assert_eq!(triggers.len(), 1);
    assert_eq!(triggers[0].0, "orders");
    assert_eq!(triggers[0].1["source"], "fallback_monitor");
    assert!(triggers[0].1["reason"].as_str().unwrap().contains("5 days behind"));

    let alerts = received.alerts();
    let messages: Vec<&str> = alerts.iter().filter_map(|a| a["message"].as_str()).collect();
    assert!(messages.iter().any(|m| m.starts_with("Fallback sync triggered for orders")));
    assert!(messages.iter().any(|m| m.contains("warning threshold")));
    assert_eq!(alerts.last().unwrap()["severity"], "CRITICAL");
}

#[tokio::test]
async fn test_running_sync_suppresses_fallback() {
    let (base, received) = stub_server().await;
    let warehouse = MemoryWarehouse::new();
    seed(&warehouse, "ORDERS", 10, 1);
    let ledger = MemoryLedger::new();
    let lease = SyncRecord::begin("orders", None, Utc::now());
    ledger.seed(lease.clone());

    let report = monitor(
        &warehouse,
        &ledger,
        &base,
        vec![("orders", monitored("ORDERS", &base, "orders"))],
    )
    .check()
    .await;

    assert_eq!(report.critical, 1);
    assert!(received.triggers().is_empty());
    assert_eq!(report.actions_taken.len(), 1);
    assert!(report.actions_taken[0].contains(&lease.sync_id));
}

#[tokio::test]
async fn test_failed_trigger_raises_critical_alert() {
    let (base, received) = stub_server().await;
    let warehouse = MemoryWarehouse::new();
    seed(&warehouse, "BROKEN", 4, 1);

    let report = monitor(
        &warehouse,
        &MemoryLedger::new(),
        &base,
        vec![("broken", monitored("BROKEN", &base, "broken"))],
    )
    .check()
    .await;

    assert_eq!(report.critical, 1);
    assert!(report.actions_taken.is_empty());
    assert_eq!(received.triggers().len(), 1);

    let alerts = received.alerts();
    let failure = alerts
        .iter()
        .find(|a| a["message"].as_str().unwrap().starts_with("FAILED to trigger fallback for broken"))
        .expect("failure alert");
    assert_eq!(failure["severity"], "CRITICAL");
    assert_eq!(failure["table"], "broken");
}

#[tokio::test]
async fn test_missing_table_is_an_error() {
    let (base, received) = stub_server().await;
    let warehouse = MemoryWarehouse::new();

    let report = monitor(
        &warehouse,
        &MemoryLedger::new(),
        &base,
        vec![("ghost", monitored("GHOST", &base, "ghost"))],
    )
    .check()
    .await;

    assert_eq!(report.errors, 1);
    assert_eq!(report.details["ghost"].status, HealthStatus::Error);
    assert_eq!(report.severity(), Severity::Critical);
    assert!(received.triggers().is_empty());
    assert!(
        received
            .alerts()
            .iter()
            .any(|a| a["message"].as_str().unwrap().starts_with("Error monitoring ghost"))
    );
}

#[tokio::test]
async fn test_unreachable_webhook_does_not_abort_the_pass() {
    let warehouse = MemoryWarehouse::new();
    seed(&warehouse, "ORDERS", 0, 1);
    let client = reqwest::Client::new();
    let monitor = HealthMonitor::new(
        Arc::new(warehouse),
        Arc::new(MemoryLedger::new()),
        Duration::from_secs(7200),
        FallbackClient::new(client.clone(), Duration::from_secs(1)),
        Arc::new(WebhookAlertSink::new(client, "http://127.0.0.1:9/alerts")),
    )
    .with_table(TableKey::new("orders"), MonitoredTable::new("ORDERS", "DAY"));

    let report = monitor.check().await;
    assert_eq!(report.tables_checked, 1);
    assert_eq!(report.details["orders"].status, HealthStatus::Ok);
}

#[tokio::test]
async fn test_failure_streak_is_critical_and_requests_fallback() {
    let (base, received) = stub_server().await;
    let warehouse = MemoryWarehouse::new();
    seed(&warehouse, "ORDERS", 0, 3);
    let ledger = MemoryLedger::new();
    ledger.seed(finished("orders", SyncStatus::Completed, 20));
    for hours_ago in [12, 8, 4] {
        ledger.seed(finished("orders", SyncStatus::Failed, hours_ago));
    }
    let mut table = monitored("ORDERS", &base, "orders");
    table.orchestration = Some(OrchestrationConfig::new(24));

    let report = monitor(&warehouse, &ledger, &base, vec![("orders", table)])
        .check()
        .await;

    let health = &report.details["orders"];
    assert_eq!(report.critical, 1);
    assert_eq!(health.status, HealthStatus::Critical);
    let orchestration = health.orchestration.as_ref().unwrap();
    assert_eq!(orchestration.consecutive_failures, 3);
    assert!(orchestration.last_completed.is_some());

    let triggers = received.triggers();
    assert_eq!(triggers.len(), 1);
    let reason = triggers[0].1["reason"].as_str().unwrap();
    assert!(reason.contains("Last 3 syncs of orders failed"));
    assert!(reason.contains("source timeout 4h ago"));
}

#[tokio::test]
async fn test_overdue_sync_is_a_warning() {
    let (base, received) = stub_server().await;
    let warehouse = MemoryWarehouse::new();
    seed(&warehouse, "ORDERS", 0, 3);
    let ledger = MemoryLedger::new();
    ledger.seed(finished("orders", SyncStatus::Completed, 30));
    let mut table = monitored("ORDERS", &base, "orders");
    table.orchestration = Some(OrchestrationConfig::new(24));

    let report = monitor(&warehouse, &ledger, &base, vec![("orders", table)])
        .check()
        .await;

    assert_eq!(report.warnings, 1);
    assert_eq!(report.details["orders"].status, HealthStatus::Warning);
    assert!(received.triggers().is_empty());
    assert!(received.alerts().iter().any(|a| {
        a["severity"] == "WARNING"
            && a["message"]
                .as_str()
                .unwrap()
                .starts_with("No sync of orders completed since")
    }));
}

#[tokio::test]
async fn test_duplicate_keys_are_flagged_without_changing_the_table() {
    let (base, received) = stub_server().await;
    let warehouse = MemoryWarehouse::new();
    seed(&warehouse, "ORDERS", 0, 3);
    let mut rows = warehouse.rows("ORDERS");
    rows.push(rows[0].clone());
    let schema = warehouse.table_schema("ORDERS").await.unwrap().unwrap();
    warehouse.seed("ORDERS", schema, rows);

    let mut table = monitored("ORDERS", &base, "orders");
    table.key_columns = vec!["ID".to_string()];
    table.duplicate_threshold_percent = 5.0;

    let report = monitor(&warehouse, &MemoryLedger::new(), &base, vec![("orders", table)])
        .check()
        .await;

    let health = &report.details["orders"];
    assert_eq!(health.status, HealthStatus::Warning);
    let duplicates = health.duplicates.as_ref().unwrap();
    assert_eq!((duplicates.groups, duplicates.extra_rows), (1, 1));
    assert_eq!(duplicates.percent, 25.0);
    assert_eq!(warehouse.rows("ORDERS").len(), 4);
    assert!(received.triggers().is_empty());
    assert!(
        received
            .alerts()
            .iter()
            .any(|a| a["message"].as_str().unwrap().contains("1 duplicate row(s) across 1 key(s)"))
    );
}
