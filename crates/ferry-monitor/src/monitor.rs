//! The freshness control loop body: probe every table, run its opt-in
//! history and duplicate checks, classify, act.
//!
//! The monitor never sees inside a running sync. Before requesting a fallback
//! for a critical table it checks the ledger for a live lease and skips the
//! request when one exists; the engine refuses overlapping runs on its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ferry_core::emit;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{error, info, warn};

use ferry::config::TableKey;
use ferry::ledger::SyncRecordStore;
use ferry::Warehouse;

use crate::alert::{Alert, AlertSink, Severity};
use crate::checks::{DuplicateHealth, OrchestrationHealth, assess_duplicates, assess_orchestration};
use crate::config::MonitoredTable;
use crate::fallback::{FallbackClient, FallbackRequest};
use crate::health::{HealthStatus, TableHealth, classify, probe};
use crate::metrics::events::{
    AlertEmitted, FallbackTriggered, PipelineFailureStreak, TableDuplicateRows, TableFreshness,
    TableHealthStatus, TableRowCount,
};

/// Result of one monitoring pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    pub timestamp: DateTime<Utc>,
    pub tables_checked: usize,
    pub critical: usize,
    pub warnings: usize,
    pub errors: usize,
    pub actions_taken: Vec<String>,
    pub details: IndexMap<String, TableHealth>,
}

impl MonitorReport {
    fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            tables_checked: 0,
            critical: 0,
            warnings: 0,
            errors: 0,
            actions_taken: Vec::new(),
            details: IndexMap::new(),
        }
    }

    /// Severity of the pass as a whole. Probe errors count as critical.
    pub fn severity(&self) -> Severity {
        if self.critical + self.errors > 0 {
            Severity::Critical
        } else if self.warnings > 0 {
            Severity::Warning
        } else {
            Severity::Info
        }
    }

    fn summary(&self) -> String {
        match self.severity() {
            Severity::Critical => format!(
                "Monitoring completed: {} critical issue(s), {} action(s) taken",
                self.critical + self.errors,
                self.actions_taken.len()
            ),
            Severity::Warning => format!("Monitoring completed: {} warning(s)", self.warnings),
            Severity::Info => "Monitoring completed: all tables healthy".to_string(),
        }
    }
}

/// Watches a set of target tables.
pub struct HealthMonitor {
    tables: Vec<(TableKey, MonitoredTable)>,
    warehouse: Arc<dyn Warehouse>,
    ledger: Arc<dyn SyncRecordStore>,
    lease_timeout: Duration,
    fallback: FallbackClient,
    sink: Arc<dyn AlertSink>,
}

impl HealthMonitor {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        ledger: Arc<dyn SyncRecordStore>,
        lease_timeout: Duration,
        fallback: FallbackClient,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            tables: Vec::new(),
            warehouse,
            ledger,
            lease_timeout,
            fallback,
            sink,
        }
    }

    #[must_use]
    pub fn with_table(mut self, key: TableKey, table: MonitoredTable) -> Self {
        self.tables.push((key, table));
        self
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Run one pass now.
    pub async fn check(&self) -> MonitorReport {
        self.check_at(Utc::now()).await
    }

    /// Run one pass, measuring freshness against `now`.
    pub async fn check_at(&self, now: DateTime<Utc>) -> MonitorReport {
        let mut report = MonitorReport::new(now);

        for (key, table) in &self.tables {
            let mut health = classify(
                key.id(),
                table,
                probe(self.warehouse.as_ref(), table).await,
                now,
            );
            health.orchestration = self.orchestration(key, table, now).await;
            if health.status != HealthStatus::Error {
                health.duplicates = self.duplicates(table, health.row_count.unwrap_or_default()).await;
            }
            health.fold_checks();
            self.record(&health);

            match health.status {
                HealthStatus::Ok => {}
                HealthStatus::Warning => {
                    report.warnings += 1;
                    self.alert(Alert::new(Severity::Warning, &health.message).for_table(key.id()))
                        .await;
                }
                HealthStatus::Critical => {
                    report.critical += 1;
                    if let Some(action) = self.fallback(key, table, &health, now).await {
                        report.actions_taken.push(action);
                    }
                }
                HealthStatus::Error => {
                    report.errors += 1;
                    let message = format!("Error monitoring {key}: {}", health.message);
                    self.alert(Alert::new(Severity::Critical, message).for_table(key.id()))
                        .await;
                }
            }

            report.tables_checked += 1;
            report.details.insert(key.id().to_string(), health);
        }

        let summary = report.summary();
        self.alert(Alert::new(report.severity(), &summary)).await;
        info!(
            tables_checked = report.tables_checked,
            critical = report.critical,
            warnings = report.warnings,
            errors = report.errors,
            actions = ?report.actions_taken,
            details = %serde_json::to_string(&report.details).unwrap_or_default(),
            "{summary}"
        );
        report
    }

    async fn orchestration(
        &self,
        key: &TableKey,
        table: &MonitoredTable,
        now: DateTime<Utc>,
    ) -> Option<OrchestrationHealth> {
        let config = table.orchestration.as_ref()?;
        let pipeline = table.pipeline.as_deref().unwrap_or(key.id());
        Some(match self.ledger.records(pipeline).await {
            Ok(records) => assess_orchestration(pipeline, &records, config, now),
            Err(e) => OrchestrationHealth::error(pipeline, format!("Failed to read sync history of {pipeline}: {e}")),
        })
    }

    async fn duplicates(&self, table: &MonitoredTable, row_count: u64) -> Option<DuplicateHealth> {
        if table.key_columns.is_empty() {
            return None;
        }
        Some(
            match self
                .warehouse
                .duplicate_keys(&table.target_table, &table.key_columns)
                .await
            {
                Ok(stats) => assess_duplicates(
                    &table.target_table,
                    stats,
                    row_count,
                    table.duplicate_threshold_percent,
                ),
                Err(e) => DuplicateHealth::error(format!(
                    "Failed to count duplicate keys in {}: {e}",
                    table.target_table
                )),
            },
        )
    }

    fn record(&self, health: &TableHealth) {
        emit!(TableHealthStatus {
            table: health.table.clone(),
            level: health.status.level(),
        });
        if let Some(rows) = health.row_count {
            emit!(TableRowCount {
                table: health.table.clone(),
                rows,
            });
        }
        if let Some(lag_seconds) = health.lag_seconds {
            emit!(TableFreshness {
                table: health.table.clone(),
                lag_seconds,
            });
        }
        if let Some(duplicates) = &health.duplicates {
            emit!(TableDuplicateRows {
                table: health.table.clone(),
                rows: duplicates.extra_rows,
            });
        }
        if let Some(orchestration) = &health.orchestration {
            emit!(PipelineFailureStreak {
                table: health.table.clone(),
                failures: orchestration.consecutive_failures,
            });
        }
        info!(
            target = %health.table,
            status = %health.status,
            days_behind = ?health.days_behind,
            rows = ?health.row_count,
            "{}",
            health.message
        );
    }

    /// Request a fallback sync for a critical table. Returns the action taken.
    async fn fallback(
        &self,
        key: &TableKey,
        table: &MonitoredTable,
        health: &TableHealth,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let Some(fallback) = &table.fallback else {
            self.alert(
                Alert::new(
                    Severity::Critical,
                    format!("{}; no fallback configured", health.message),
                )
                .for_table(key.id()),
            )
            .await;
            return None;
        };

        let pipeline = table.pipeline.as_deref().unwrap_or(key.id());
        match self.ledger.active_lease(pipeline, self.lease_timeout).await {
            Ok(Some(lease)) => {
                emit!(FallbackTriggered {
                    table: key.id().to_string(),
                    result: "skipped",
                });
                info!(target = %key, sync_id = %lease.sync_id, "Sync in progress; not requesting fallback");
                self.alert(
                    Alert::new(
                        Severity::Warning,
                        format!("{}; sync {} already in progress", health.message, lease.sync_id),
                    )
                    .for_table(key.id()),
                )
                .await;
                return Some(format!(
                    "Skipped fallback for {key}: sync {} in progress",
                    lease.sync_id
                ));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(target = %key, error = %e, "Lease check failed; requesting fallback anyway");
            }
        }

        let request = FallbackRequest::new(health.message.clone(), now);
        match self.fallback.trigger(&fallback.url, &request).await {
            Ok(status) => {
                emit!(FallbackTriggered {
                    table: key.id().to_string(),
                    result: "accepted",
                });
                info!(target = %key, status, "Fallback sync requested");
                self.alert(
                    Alert::new(
                        Severity::Warning,
                        format!("Fallback sync triggered for {key}: {}", health.message),
                    )
                    .for_table(key.id()),
                )
                .await;
                Some(format!("Triggered fallback sync for {key}"))
            }
            Err(e) => {
                emit!(FallbackTriggered {
                    table: key.id().to_string(),
                    result: "failed",
                });
                error!(target = %key, error = %e, "Fallback request failed");
                self.alert(
                    Alert::new(
                        Severity::Critical,
                        format!("FAILED to trigger fallback for {key}, manual intervention required: {e}"),
                    )
                    .for_table(key.id()),
                )
                .await;
                None
            }
        }
    }

    async fn alert(&self, alert: Alert) {
        emit!(AlertEmitted {
            severity: alert.severity.as_str(),
        });
        if let Err(e) = self.sink.send(&alert).await {
            warn!(error = %e, message = %alert.message, "Failed to deliver alert");
        }
    }
}
