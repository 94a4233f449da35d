//! Applies a filled staging table to its target, once per invocation.
//!
//! MERGE upserts by key and may then delete stale rows inside the synced
//! window. REPLACE swaps the target contents for the staged rows. Zero staged
//! rows never wipe data unless the source was independently confirmed empty.
//! Reconcile statements are not retried; a failure fails the invocation.

use std::fmt;
use std::sync::Arc;

use ferry_core::emit;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{info, warn};

use crate::error::{
    DeduplicateSnafu, MergeSnafu, NoKeyColumnsSnafu, ReconcileError, ReplaceSnafu,
    StaleCleanupSnafu,
};
use crate::metrics::events::{ReconcileCompleted, StaleRowsDeleted};
use crate::value::RangeFilter;
use crate::warehouse::Warehouse;

/// How staged rows are applied to the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileMode {
    #[default]
    Merge,
    Replace,
}

impl ReconcileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileMode::Merge => "merge",
            ReconcileMode::Replace => "replace",
        }
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with one filled staging table.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub mode: ReconcileMode,
    pub key_columns: Vec<String>,
    /// Delete target rows in this window whose key was not staged (MERGE only).
    pub stale_window: Option<RangeFilter>,
    /// A separate source count reported zero rows for the synced scope.
    pub source_confirmed_empty: bool,
    /// Remove duplicate key groups already present in the target after MERGE.
    pub deduplicate: bool,
}

/// What the reconciler did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub inserted: u64,
    pub updated: u64,
    /// Rows copied by REPLACE.
    pub replaced: u64,
    pub stale_deleted: u64,
    pub duplicates_removed: u64,
    /// Steps skipped by the zero-row guard, for the outcome message.
    pub skipped: Vec<&'static str>,
}

impl ReconcileReport {
    /// Rows written to the target.
    pub fn rows_written(&self) -> u64 {
        self.inserted + self.updated + self.replaced
    }
}

pub struct Reconciler {
    warehouse: Arc<dyn Warehouse>,
    pipeline: String,
}

impl Reconciler {
    pub fn new(warehouse: Arc<dyn Warehouse>, pipeline: impl Into<String>) -> Self {
        Self {
            warehouse,
            pipeline: pipeline.into(),
        }
    }

    /// Apply `staging` (holding `staged_rows` rows) to `target`.
    pub async fn reconcile(
        &self,
        staging: &str,
        target: &str,
        staged_rows: u64,
        plan: &ReconcilePlan,
    ) -> Result<ReconcileReport, ReconcileError> {
        let mut report = ReconcileReport::default();
        let zero_unconfirmed = staged_rows == 0 && !plan.source_confirmed_empty;

        match plan.mode {
            ReconcileMode::Merge => {
                ensure!(
                    !plan.key_columns.is_empty(),
                    NoKeyColumnsSnafu { target }
                );

                if staged_rows > 0 {
                    let stats = self
                        .warehouse
                        .merge(staging, target, &plan.key_columns)
                        .await
                        .context(MergeSnafu { target })?;
                    report.inserted = stats.inserted;
                    report.updated = stats.updated;
                }

                if let Some(window) = &plan.stale_window {
                    if zero_unconfirmed {
                        warn!(
                            target = %self.pipeline,
                            window = %window,
                            "No rows fetched and source not confirmed empty; skipping stale-row cleanup"
                        );
                        report.skipped.push("stale cleanup");
                    } else {
                        report.stale_deleted = self
                            .warehouse
                            .delete_stale(staging, target, &plan.key_columns, window)
                            .await
                            .context(StaleCleanupSnafu { target })?;
                        emit!(StaleRowsDeleted {
                            pipeline: self.pipeline.clone(),
                            count: report.stale_deleted,
                        });
                    }
                }

                if plan.deduplicate {
                    report.duplicates_removed = self
                        .warehouse
                        .deduplicate(target, &plan.key_columns)
                        .await
                        .context(DeduplicateSnafu { target })?;
                }
            }
            ReconcileMode::Replace => {
                if zero_unconfirmed {
                    warn!(
                        target = %self.pipeline,
                        "No rows fetched and source not confirmed empty; keeping target contents"
                    );
                    report.skipped.push("replace");
                } else {
                    report.replaced = self
                        .warehouse
                        .replace(staging, target)
                        .await
                        .context(ReplaceSnafu { target })?;
                }
            }
        }

        emit!(ReconcileCompleted {
            pipeline: self.pipeline.clone(),
            mode: plan.mode.as_str(),
            rows: report.rows_written(),
        });
        info!(
            target = %self.pipeline,
            mode = %plan.mode,
            inserted = report.inserted,
            updated = report.updated,
            replaced = report.replaced,
            stale_deleted = report.stale_deleted,
            duplicates_removed = report.duplicates_removed,
            "Reconciled staging into target"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryWarehouse;
    use crate::schema::{ColumnDef, ColumnType, TableSchema};
    use crate::value::Record;
    use chrono::NaiveDate;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnDef {
                name: "ID".into(),
                column_type: ColumnType::String,
                nullable: true,
            },
            ColumnDef {
                name: "DAY".into(),
                column_type: ColumnType::Date,
                nullable: true,
            },
            ColumnDef {
                name: "VALUE".into(),
                column_type: ColumnType::Int64,
                nullable: true,
            },
        ])
    }

    fn row(id: &str, day: &str, value: i64) -> Record {
        let mut record = Record::new();
        record.insert("ID".into(), json!(id));
        record.insert("DAY".into(), json!(day));
        record.insert("VALUE".into(), json!(value));
        record
    }

    fn plan(mode: ReconcileMode) -> ReconcilePlan {
        ReconcilePlan {
            mode,
            key_columns: vec!["ID".into()],
            stale_window: None,
            source_confirmed_empty: false,
            deduplicate: false,
        }
    }

    fn window() -> RangeFilter {
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        RangeFilter::between("DAY", day, day)
    }

    fn setup(target: Vec<Record>, staged: Vec<Record>) -> (MemoryWarehouse, Reconciler) {
        let warehouse = MemoryWarehouse::new();
        warehouse.seed("T", schema(), target);
        warehouse.seed("S", schema(), staged);
        let reconciler = Reconciler::new(Arc::new(warehouse.clone()), "t");
        (warehouse, reconciler)
    }

    #[tokio::test]
    async fn test_merge_updates_and_inserts() {
        let (warehouse, reconciler) = setup(
            vec![row("A", "2024-01-01", 10)],
            vec![row("A", "2024-01-01", 20), row("D", "2024-01-02", 1)],
        );
        let report = reconciler
            .reconcile("S", "T", 2, &plan(ReconcileMode::Merge))
            .await
            .unwrap();
        assert_eq!((report.inserted, report.updated), (1, 1));

        let rows = warehouse.rows("T");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["VALUE"], json!(20));
    }

    #[tokio::test]
    async fn test_merge_requires_keys() {
        let (_, reconciler) = setup(vec![], vec![]);
        let mut merge = plan(ReconcileMode::Merge);
        merge.key_columns.clear();
        let err = reconciler.reconcile("S", "T", 0, &merge).await.unwrap_err();
        assert!(matches!(err, ReconcileError::NoKeyColumns { .. }));
    }

    #[tokio::test]
    async fn test_stale_cleanup_is_scoped_to_window() {
        let (warehouse, reconciler) = setup(
            vec![
                row("A", "2024-01-01", 1),
                row("B", "2024-01-02", 2),
                row("C", "2024-01-02", 3),
            ],
            vec![row("B", "2024-01-02", 5)],
        );
        let mut merge = plan(ReconcileMode::Merge);
        merge.stale_window = Some(window());

        let report = reconciler.reconcile("S", "T", 1, &merge).await.unwrap();
        assert_eq!(report.stale_deleted, 1);
        let ids: Vec<_> = warehouse.rows("T").iter().map(|r| r["ID"].clone()).collect();
        assert_eq!(ids, vec![json!("A"), json!("B")]);
    }

    #[tokio::test]
    async fn test_zero_rows_skip_destructive_steps() {
        let target = vec![row("A", "2024-01-02", 1), row("B", "2024-01-02", 2)];
        let (warehouse, reconciler) = setup(target.clone(), vec![]);

        let mut merge = plan(ReconcileMode::Merge);
        merge.stale_window = Some(window());
        let report = reconciler.reconcile("S", "T", 0, &merge).await.unwrap();
        assert_eq!(report.skipped, vec!["stale cleanup"]);

        let report = reconciler
            .reconcile("S", "T", 0, &plan(ReconcileMode::Replace))
            .await
            .unwrap();
        assert_eq!(report.skipped, vec!["replace"]);
        assert_eq!(warehouse.rows("T"), target);
    }

    #[tokio::test]
    async fn test_confirmed_empty_source_clears_window() {
        let (warehouse, reconciler) = setup(
            vec![row("A", "2024-01-01", 1), row("B", "2024-01-02", 2)],
            vec![],
        );
        let mut merge = plan(ReconcileMode::Merge);
        merge.stale_window = Some(window());
        merge.source_confirmed_empty = true;

        let report = reconciler.reconcile("S", "T", 0, &merge).await.unwrap();
        assert_eq!(report.stale_deleted, 1);
        assert_eq!(warehouse.rows("T").len(), 1);
    }

    #[tokio::test]
    async fn test_replace_and_failure() {
        let (warehouse, reconciler) = setup(
            vec![row("OLD", "2024-01-01", 1)],
            vec![row("A", "2024-01-01", 1), row("B", "2024-01-01", 2)],
        );
        let report = reconciler
            .reconcile("S", "T", 2, &plan(ReconcileMode::Replace))
            .await
            .unwrap();
        assert_eq!(report.replaced, 2);
        assert_eq!(warehouse.rows("T").len(), 2);

        warehouse.fail_merge(true);
        let err = reconciler
            .reconcile("S", "T", 2, &plan(ReconcileMode::Merge))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Merge { .. }));
        assert_eq!(warehouse.rows("T").len(), 2);
    }
}
