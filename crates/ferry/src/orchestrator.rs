//! One sync invocation per call: resolve the target, extract into a staging
//! table, reconcile once, clean up, report.
//!
//! ```text
//! INIT -> SCHEMA_READY -> EXTRACTING -> RECONCILING -> CLEANUP -> outcome
//! ```
//!
//! Errors and panics are caught here and turned into an `error` outcome. The
//! staging table is dropped on every exit path; a drop failure is logged and
//! the table is left to its expiry.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use ferry_core::emit;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::{PaginationKind, SyncType, TableConfig, TableKey};
use crate::error::{
    ErrorKind, ExtractionSnafu, IntrospectSnafu, InvalidRequestSnafu, LedgerSnafu, NormalizeSnafu,
    ReconcileSnafu, StagingSnafu, SyncError, TargetSetupSnafu, WarehouseError,
};
use crate::ledger::{LeaseGuard, SyncRecord, SyncRecordStore, SyncStatus, next_chunk};
use crate::metrics::events::{
    RowsExtracted, StagingCleanupFailed, SyncCompleted, SyncDuration, SyncFailed, SyncStarted,
};
use crate::normalize::RecordShaper;
use crate::pool::SourcePool;
use crate::reconcile::{ReconcileMode, ReconcilePlan, ReconcileReport, Reconciler};
use crate::schema::{TableSchema, map_columns};
use crate::source::{BatchExtractor, ExtractPlan, Extracted, Pagination};
use crate::staging::{StagingLoader, StagingTable};
use crate::validate::{ValidationStatus, ValidationSummary, validate_counts};
use crate::value::RangeFilter;
use crate::warehouse::{TableOptions, Warehouse};

/// Inclusive date range carried by a trigger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Parameters of one invocation. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRequest {
    /// Resolve the target and validate counts only.
    pub dry_run: bool,
    pub date_range: Option<DateRange>,
    /// Overrides the table's configured sync type.
    pub sync_type: Option<SyncType>,
    /// Who asked, e.g. `scheduler` or `fallback_monitor`.
    pub source: Option<String>,
    pub reason: Option<String>,
    pub timestamp: Option<String>,
}

impl SyncRequest {
    pub fn scheduled() -> Self {
        Self {
            source: Some("scheduler".into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Warning,
    Error,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Warning => "warning",
            OutcomeStatus::Error => "error",
        }
    }
}

/// What a caller gets back from an invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub status: OutcomeStatus,
    pub rows_processed: u64,
    pub duration_seconds: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSummary>,
    /// The time budget ran out; the remaining range is retried next run.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<String>,
    #[serde(skip)]
    pub error_kind: Option<ErrorKind>,
}

impl SyncOutcome {
    fn new(status: OutcomeStatus, message: impl Into<String>, started: Instant) -> Self {
        Self {
            status,
            rows_processed: 0,
            duration_seconds: (started.elapsed().as_secs_f64() * 100.0).round() / 100.0,
            message: message.into(),
            validation: None,
            partial: false,
            sync_id: None,
            error_kind: None,
        }
    }

    fn failed(error: &SyncError, started: Instant) -> Self {
        Self {
            error_kind: Some(error.kind()),
            ..Self::new(OutcomeStatus::Error, error.to_string(), started)
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == OutcomeStatus::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    SchemaReady,
    Extracting,
    Reconciling,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Init => "INIT",
            Phase::SchemaReady => "SCHEMA_READY",
            Phase::Extracting => "EXTRACTING",
            Phase::Reconciling => "RECONCILING",
            Phase::Cleanup => "CLEANUP",
        })
    }
}

/// The slice of the source one invocation covers.
#[derive(Debug, Clone, PartialEq)]
struct SyncScope {
    mode: ReconcileMode,
    range: Option<(NaiveDate, NaiveDate)>,
    filter: Option<RangeFilter>,
}

/// Where an invocation got to, kept outside the unwind boundary.
#[derive(Debug)]
struct Progress {
    phase: Phase,
    position: String,
    rows_extracted: u64,
    rows_staged: u64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            phase: Phase::Init,
            position: String::new(),
            rows_extracted: 0,
            rows_staged: 0,
        }
    }
}

struct Executed {
    report: ReconcileReport,
    staged_rows: u64,
    partial: bool,
}

/// Runs the sync protocol for one configured table.
///
/// Cheap to clone; the pool, warehouse and ledger are shared handles.
#[derive(Clone)]
pub struct SyncOrchestrator {
    key: TableKey,
    table: Arc<TableConfig>,
    pool: SourcePool,
    warehouse: Arc<dyn Warehouse>,
    ledger: Arc<dyn SyncRecordStore>,
    lease_timeout: Duration,
}

impl SyncOrchestrator {
    pub fn new(
        key: TableKey,
        table: TableConfig,
        pool: SourcePool,
        warehouse: Arc<dyn Warehouse>,
        ledger: Arc<dyn SyncRecordStore>,
        lease_timeout: Duration,
    ) -> Self {
        Self {
            key,
            table: Arc::new(table),
            pool,
            warehouse,
            ledger,
            lease_timeout,
        }
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn table(&self) -> &TableConfig {
        &self.table
    }

    /// Run one invocation. Never fails; failures are reported in the outcome.
    pub async fn run(&self, request: SyncRequest) -> SyncOutcome {
        let started = Instant::now();
        let sync_type = request.sync_type.unwrap_or(self.table.sync_type);

        emit!(SyncStarted {
            pipeline: self.key.id().to_string(),
            sync_type: sync_type.as_str(),
        });
        info!(
            target = %self.key,
            sync_type = sync_type.as_str(),
            dry_run = request.dry_run,
            source = request.source.as_deref().unwrap_or("api"),
            reason = request.reason.as_deref().unwrap_or(""),
            "Sync requested"
        );

        let outcome = if request.dry_run {
            self.dry_run(&request, sync_type, started).await
        } else {
            self.sync(&request, sync_type, started).await
        };

        emit!(SyncCompleted {
            pipeline: self.key.id().to_string(),
            status: outcome.status.as_str(),
        });
        emit!(SyncDuration {
            pipeline: self.key.id().to_string(),
            duration: started.elapsed(),
        });
        info!(
            target = %self.key,
            status = outcome.status.as_str(),
            rows = outcome.rows_processed,
            duration_secs = outcome.duration_seconds,
            message = %outcome.message,
            "Sync finished"
        );
        outcome
    }

    async fn sync(&self, request: &SyncRequest, sync_type: SyncType, started: Instant) -> SyncOutcome {
        let today = Utc::now().date_naive();

        let scope = match self.resolve_scope(request, sync_type, today).await {
            Ok(Some(scope)) => scope,
            Ok(None) => {
                info!(target = %self.key, "All chunks up to the horizon are complete");
                return SyncOutcome::new(OutcomeStatus::Success, "nothing to sync", started);
            }
            Err(e) => return self.fail(e, &Progress::default(), None, started),
        };

        let mut record = SyncRecord::begin(self.key.id(), scope.range, Utc::now());
        match self.ledger.try_begin(&record, self.lease_timeout).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(target = %self.key, "Another sync holds the lease; not starting");
                return SyncOutcome::new(OutcomeStatus::Warning, "sync already in progress", started);
            }
            Err(source) => return self.fail(SyncError::Ledger { source }, &Progress::default(), None, started),
        }
        let lease = LeaseGuard::new(self.ledger.clone(), record.clone());

        let mut progress = Progress::default();
        let result = AssertUnwindSafe(self.execute(&scope, today, &mut progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(SyncError::Panicked {
                    message: panic_message(panic.as_ref()),
                })
            });

        let mut outcome = match result {
            Ok(executed) => self.complete(&scope, executed, started).await,
            Err(e) => self.fail(e, &progress, Some(&scope), started),
        };
        outcome.sync_id = Some(record.sync_id.clone());

        let status = match (outcome.status, outcome.partial) {
            (OutcomeStatus::Error, _) => SyncStatus::Failed,
            (_, true) => SyncStatus::Pending,
            _ => SyncStatus::Completed,
        };
        if status == SyncStatus::Failed {
            record.fail(outcome.message.clone(), progress.rows_staged, Utc::now());
        } else {
            record.finish(status, outcome.rows_processed, Utc::now());
        }
        if let Err(e) = self.ledger.update(&record).await {
            error!(
                target = %self.key,
                sync_id = %record.sync_id,
                error = %e,
                "Failed to record sync result; lease expires on its own"
            );
        }
        lease.disarm();
        outcome
    }

    /// Decide the window for this invocation. `None` means nothing is due.
    async fn resolve_scope(
        &self,
        request: &SyncRequest,
        sync_type: SyncType,
        today: NaiveDate,
    ) -> Result<Option<SyncScope>, SyncError> {
        let table = &self.table;
        let mode = match sync_type {
            SyncType::Incremental => ReconcileMode::Merge,
            SyncType::Full => table.reconcile,
        };
        if mode == ReconcileMode::Merge && table.key_columns.is_empty() {
            return InvalidRequestSnafu {
                message: "merge reconcile requires key_columns",
            }
            .fail();
        }

        let window_column = || {
            table.window_column().context(InvalidRequestSnafu {
                message: format!("table '{}' has no partition_column or incremental_column", self.key),
            })
        };

        let range = if let Some(range) = request.date_range {
            ensure!(
                range.start <= range.end,
                InvalidRequestSnafu {
                    message: format!("date_range start {} is after end {}", range.start, range.end),
                }
            );
            Some(range)
        } else if let Some(chunking) = &table.chunking {
            let records = self.ledger.records(self.key.id()).await.context(LedgerSnafu)?;
            match next_chunk(&records, today, chunking) {
                Some((start, end)) => Some(DateRange { start, end }),
                None => return Ok(None),
            }
        } else {
            None
        };

        let (range, filter) = match (range, sync_type) {
            (Some(range), _) => (
                Some((range.start, range.end)),
                Some(RangeFilter::between(window_column()?, range.start, range.end)),
            ),
            (None, SyncType::Incremental) => {
                let column = table
                    .incremental_column
                    .as_deref()
                    .map_or_else(window_column, Ok)?;
                let start = today
                    .checked_sub_days(Days::new(u64::from(table.lookback_days)))
                    .unwrap_or(today);
                (Some((start, today)), Some(RangeFilter::at_least(column, start)))
            }
            (None, SyncType::Full) => (None, None),
        };

        Ok(Some(SyncScope {
            mode,
            range,
            filter,
        }))
    }

    /// Everything between taking the lease and releasing it. Runs inside the
    /// unwind boundary.
    async fn execute(
        &self,
        scope: &SyncScope,
        today: NaiveDate,
        progress: &mut Progress,
    ) -> Result<Executed, SyncError> {
        let schema = self.ensure_target().await?;
        progress.phase = Phase::SchemaReady;

        let loader = StagingLoader::new(
            self.warehouse.clone(),
            self.key.id(),
            self.table.staging_expiration(),
        );
        let mut staging = loader
            .create(&self.table.target_table, &schema, Utc::now())
            .await
            .context(StagingSnafu)?;
        let guard = loader.guard(&staging);

        let result = self
            .load_and_reconcile(&loader, &mut staging, &schema, scope, today, progress)
            .await;

        progress.phase = Phase::Cleanup;
        if let Err(e) = loader.dispose(&staging).await {
            emit!(StagingCleanupFailed {
                pipeline: self.key.id().to_string(),
            });
            warn!(
                target = %self.key,
                staging = %staging.name,
                expires_at = %staging.expires_at,
                error = %e,
                "Failed to drop staging table; left to expire"
            );
        }
        guard.disarm();
        result
    }

    async fn load_and_reconcile(
        &self,
        loader: &StagingLoader,
        staging: &mut StagingTable,
        schema: &TableSchema,
        scope: &SyncScope,
        today: NaiveDate,
        progress: &mut Progress,
    ) -> Result<Executed, SyncError> {
        progress.phase = Phase::Extracting;
        let table = &self.table;
        let partition = table
            .partition_column
            .clone()
            .map(|column| (column, table.null_partition.clone()));
        let mut shaper =
            RecordShaper::new(schema, &table.key_columns, partition, today).context(NormalizeSnafu)?;
        let mut extractor = BatchExtractor::new(self.pool.clone(), self.extract_plan(scope, today));
        progress.position = extractor.progress().position.clone();

        let mut partial = false;
        loop {
            let extracted = extractor.next_batch().await;
            progress.position = extractor.progress().position.clone();
            match extracted.context(ExtractionSnafu)? {
                Extracted::Batch(batch) => {
                    let first_row = usize::try_from(progress.rows_extracted).unwrap_or(usize::MAX);
                    progress.rows_extracted += batch.len() as u64;
                    emit!(RowsExtracted {
                        pipeline: self.key.id().to_string(),
                        count: batch.len() as u64,
                    });

                    let records = shaper
                        .shape(&batch.columns, &batch.rows, first_row)
                        .context(NormalizeSnafu)?;
                    loader.append(staging, &records).await.context(StagingSnafu)?;
                    progress.rows_staged = staging.rows;
                }
                Extracted::Exhausted => break,
                Extracted::BudgetExceeded => {
                    warn!(
                        target = %self.key,
                        position = %progress.position,
                        rows = progress.rows_staged,
                        "Time budget exhausted; reconciling the staged prefix only"
                    );
                    partial = true;
                    break;
                }
            }
        }

        progress.phase = Phase::Reconciling;
        if partial && scope.mode == ReconcileMode::Replace {
            warn!(target = %self.key, "Partial extraction never replaces the target");
            return Ok(Executed {
                report: ReconcileReport {
                    skipped: vec!["replace"],
                    ..ReconcileReport::default()
                },
                staged_rows: staging.rows,
                partial,
            });
        }

        let stale_window = if table.stale_cleanup && !partial {
            self.stale_window(scope, today)
        } else {
            None
        };
        let needs_confirmation =
            staging.rows == 0 && (scope.mode == ReconcileMode::Replace || stale_window.is_some());
        let source_confirmed_empty = needs_confirmation && self.confirm_source_empty(scope).await;

        let plan = ReconcilePlan {
            mode: scope.mode,
            key_columns: table.key_columns.clone(),
            stale_window,
            source_confirmed_empty,
            deduplicate: table.deduplicate,
        };
        let report = Reconciler::new(self.warehouse.clone(), self.key.id())
            .reconcile(&staging.name, &table.target_table, staging.rows, &plan)
            .await
            .context(ReconcileSnafu)?;

        Ok(Executed {
            report,
            staged_rows: staging.rows,
            partial,
        })
    }

    /// Target schema, creating the table from the source when it is absent.
    async fn ensure_target(&self) -> Result<TableSchema, SyncError> {
        let target = &self.table.target_table;
        if let Some(schema) = self
            .warehouse
            .table_schema(target)
            .await
            .context(TargetSetupSnafu { target })?
        {
            return Ok(schema);
        }

        let columns = self
            .pool
            .describe(&self.table.source_table)
            .await
            .context(IntrospectSnafu)?;
        let schema = map_columns(&columns);
        let options = TableOptions {
            expires_at: None,
            partition_column: self.table.partition_column.clone(),
            cluster_columns: self.table.cluster_columns.clone(),
        };

        match self.warehouse.create_table(target, &schema, &options).await {
            Ok(()) => {
                info!(
                    target = %self.key,
                    table = %target,
                    columns = schema.columns.len(),
                    "Created target table from source schema"
                );
                Ok(schema)
            }
            // Created concurrently by another invocation.
            Err(WarehouseError::TableExists { .. }) => {
                let schema = self
                    .warehouse
                    .table_schema(target)
                    .await
                    .context(TargetSetupSnafu { target })?;
                schema.ok_or_else(|| SyncError::TargetSetup {
                    target: target.clone(),
                    source: WarehouseError::TableNotFound {
                        table: target.clone(),
                    },
                })
            }
            Err(source) => Err(SyncError::TargetSetup {
                target: target.clone(),
                source,
            }),
        }
    }

    fn extract_plan(&self, scope: &SyncScope, today: NaiveDate) -> ExtractPlan {
        let table = &self.table;
        let mut filter = scope.filter.clone();
        let pagination = match table.pagination {
            PaginationKind::Offset => Pagination::Offset,
            PaginationKind::Cursor => Pagination::Cursor {
                column: table.cursor_column.clone().unwrap_or_default(),
            },
            PaginationKind::Range => match filter.take() {
                Some(window) => Pagination::Range {
                    end: window.end.unwrap_or(today).max(window.start),
                    start: window.start,
                    column: window.column,
                    window_days: table.window_days,
                },
                None => {
                    debug!(target = %self.key, "Unbounded full sync; range pagination falls back to offset");
                    Pagination::Offset
                }
            },
        };

        ExtractPlan {
            table: table.source_table.clone(),
            order_by: table.effective_order_by().to_vec(),
            filter,
            pagination,
            batch_size: table.batch_size,
            time_budget: table.time_budget(),
        }
    }

    /// Window stale-row cleanup may touch. A full sync without an explicit
    /// range only cleans today's partition.
    fn stale_window(&self, scope: &SyncScope, today: NaiveDate) -> Option<RangeFilter> {
        scope.filter.clone().or_else(|| {
            self.table
                .window_column()
                .map(|column| RangeFilter::between(column, today, today))
        })
    }

    /// Count the source window independently of extraction.
    async fn confirm_source_empty(&self, scope: &SyncScope) -> bool {
        if !self.table.verify_empty_source {
            return false;
        }
        match self
            .pool
            .count(&self.table.source_table, scope.filter.as_ref())
            .await
        {
            Ok(0) => {
                info!(target = %self.key, "Source count confirms the window is empty");
                true
            }
            Ok(count) => {
                warn!(
                    target = %self.key,
                    count,
                    "Extraction returned no rows but the source counts rows; treating as unconfirmed"
                );
                false
            }
            Err(e) => {
                warn!(target = %self.key, error = %e, "Source count failed; treating as unconfirmed");
                false
            }
        }
    }

    async fn complete(&self, scope: &SyncScope, executed: Executed, started: Instant) -> SyncOutcome {
        let Executed {
            report,
            staged_rows,
            partial,
        } = executed;
        let target = &self.table.target_table;

        let mut message = if partial {
            format!("Time budget exhausted after {staged_rows} rows; remaining range is retried next run")
        } else {
            format!("Synced {staged_rows} rows into {target}")
        };
        for step in &report.skipped {
            message.push_str(&format!("; skipped {step}: no rows fetched and source not confirmed empty"));
        }

        let mut outcome = SyncOutcome::new(
            if partial {
                OutcomeStatus::Warning
            } else {
                OutcomeStatus::Success
            },
            message,
            started,
        );
        outcome.rows_processed = staged_rows;
        outcome.partial = partial;

        if self.table.validate && !partial {
            let summary = self.validate(scope).await;
            if summary.status == ValidationStatus::Warning {
                outcome.status = OutcomeStatus::Warning;
                if let Some(note) = &summary.message {
                    outcome.message.push_str(&format!("; {note}"));
                }
            }
            outcome.validation = Some(summary);
        }
        outcome.duration_seconds = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        outcome
    }

    async fn validate(&self, scope: &SyncScope) -> ValidationSummary {
        validate_counts(
            self.key.id(),
            &self.pool,
            self.warehouse.as_ref(),
            &self.table.source_table,
            &self.table.target_table,
            scope.filter.as_ref(),
            self.table.validation_threshold_percent,
        )
        .await
    }

    /// Resolve the target and validate counts without writing anything.
    async fn dry_run(&self, request: &SyncRequest, sync_type: SyncType, started: Instant) -> SyncOutcome {
        let today = Utc::now().date_naive();
        let scope = match self.resolve_scope(request, sync_type, today).await {
            Ok(Some(scope)) => scope,
            Ok(None) => return SyncOutcome::new(OutcomeStatus::Success, "nothing to sync", started),
            Err(e) => return self.fail(e, &Progress::default(), None, started),
        };

        let target = &self.table.target_table;
        match self.warehouse.table_schema(target).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return match self.pool.describe(&self.table.source_table).await {
                    Ok(columns) => SyncOutcome::new(
                        OutcomeStatus::Success,
                        format!(
                            "Dry run: target {target} does not exist and would be created with {} columns",
                            columns.len()
                        ),
                        started,
                    ),
                    Err(source) => self.fail(SyncError::Introspect { source }, &Progress::default(), Some(&scope), started),
                };
            }
            Err(source) => {
                let error = SyncError::TargetSetup {
                    target: target.clone(),
                    source,
                };
                return self.fail(error, &Progress::default(), Some(&scope), started);
            }
        }

        let summary = self.validate(&scope).await;
        let status = match summary.status {
            ValidationStatus::Success => OutcomeStatus::Success,
            ValidationStatus::Warning => OutcomeStatus::Warning,
            ValidationStatus::Error => OutcomeStatus::Error,
        };
        let message = summary
            .message
            .clone()
            .unwrap_or_else(|| format!("Dry run: {target} is within the validation threshold"));
        let mut outcome = SyncOutcome::new(status, message, started);
        outcome.validation = Some(summary);
        outcome
    }

    fn fail(
        &self,
        error: SyncError,
        progress: &Progress,
        scope: Option<&SyncScope>,
        started: Instant,
    ) -> SyncOutcome {
        let kind = error.kind();
        emit!(SyncFailed {
            pipeline: self.key.id().to_string(),
            kind: kind.as_str(),
        });
        error!(
            target = %self.key,
            phase = %progress.phase,
            kind = kind.as_str(),
            position = %progress.position,
            window = %scope.and_then(|s| s.filter.as_ref()).map(ToString::to_string).unwrap_or_default(),
            rows_extracted = progress.rows_extracted,
            rows_staged = progress.rows_staged,
            error = %error,
            "Sync failed"
        );
        let mut outcome = SyncOutcome::failed(&error, started);
        outcome.rows_processed = progress.rows_staged;
        outcome
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
