//! The HTTP trigger surface, served on an ephemeral port.
//!
//! Run with: cargo test --test trigger_http

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use ferry::backend::{MemoryLedger, MemorySource, MemoryWarehouse};
use ferry::credentials::{CredentialProvider, StaticSecretStore};
use ferry::pool::{PoolOptions, SourcePool};
use ferry::schema::SourceColumn;
use ferry::source::SourceTableRef;
use ferry::trigger::{TriggerState, serve_on};
use ferry::value::Value;
use ferry::{PipelineError, SyncOrchestrator, TableConfig, TableKey};

struct Server {
    addr: SocketAddr,
    source: MemorySource,
    warehouse: MemoryWarehouse,
    ledger: MemoryLedger,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), PipelineError>>,
}

impl Server {
    async fn start() -> Self {
        let source = MemorySource::new();
        let today = Utc::now().date_naive();
        source.create_table(
            "ORDERS",
            vec![SourceColumn::new("ID", "INTEGER"), SourceColumn::new("DAY", "DATE")],
            (1..=3).map(|id| vec![Value::Int(id), Value::Date(today)]).collect(),
        );
        let warehouse = MemoryWarehouse::new();
        let ledger = MemoryLedger::new();
        let pool = SourcePool::new(
            Arc::new(source.clone()),
            Arc::new(CredentialProvider::new(
                Arc::new(StaticSecretStore::new()),
                Duration::from_secs(60),
            )),
            PoolOptions::default(),
        );

        let mut table = TableConfig::new(SourceTableRef::new("ORDERS"), "orders");
        table.key_columns = vec!["ID".into()];
        table.partition_column = Some("DAY".into());
        let orchestrator = SyncOrchestrator::new(
            TableKey::new("orders"),
            table,
            pool,
            Arc::new(warehouse.clone()),
            Arc::new(ledger.clone()),
            Duration::from_secs(7200),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(serve_on(
            listener,
            TriggerState::new([orchestrator]),
            shutdown.clone(),
        ));

        Self {
            addr,
            source,
            warehouse,
            ledger,
            shutdown,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_sync_waits_for_outcome() {
    let server = Server::start().await;
    let client = reqwest::Client::new();

    let response = client.post(server.url("/sync/orders")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["status"], json!("success"));
    assert_eq!(body["rows_processed"], json!(3));
    assert!(body["sync_id"].is_string());
    assert!(body.get("partial").is_none());
    assert_eq!(server.warehouse.rows("orders").len(), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_background_sync_is_accepted() {
    let server = Server::start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(server.url("/sync/orders?wait=false"))
        .json(&json!({"source": "fallback_monitor", "reason": "stale data"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 202);
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["status"], json!("accepted"));

    for _ in 0..50 {
        if server.warehouse.rows("orders").len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.warehouse.rows("orders").len(), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_table_is_not_found() {
    let server = Server::start().await;

    let response = reqwest::Client::new()
        .post(server.url("/sync/missing"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["status"], json!("error"));

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let server = Server::start().await;

    let response = reqwest::Client::new()
        .post(server.url("/sync/orders"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert!(server.warehouse.created_tables().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_invalid_range_is_bad_request() {
    let server = Server::start().await;

    let response = reqwest::Client::new()
        .post(server.url("/sync/orders"))
        .json(&json!({"date_range": {"start": "2024-02-01", "end": "2024-01-01"}}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    let body: JsonValue = response.json().await.unwrap();
    assert_eq!(body["status"], json!("error"));
    assert!(body["message"].as_str().unwrap().contains("after end"));

    server.stop().await;
}

#[tokio::test]
async fn test_health_reports_tables() {
    let server = Server::start().await;

    let body: JsonValue = reqwest::get(server.url("/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body, json!({"status": "ok", "tables": 1}));

    server.stop().await;
}

#[tokio::test]
async fn test_client_disconnect_does_not_cancel_sync() {
    let server = Server::start().await;
    server.source.set_fetch_delay(Duration::from_millis(800));
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    let result = client.post(server.url("/sync/orders")).send().await;
    assert!(result.is_err());

    let mut landed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if server.warehouse.rows("orders").len() == 3 {
            landed = true;
            break;
        }
    }
    assert!(landed, "sync should finish after the client went away");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let records = server.ledger.all();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ferry::ledger::SyncStatus::Completed);

    server.stop().await;
}
