//! Internal events for sync engine metrics.
//!
//! Every event carries a `pipeline` label (the configured table key) so
//! multi-table deployments can be observed per table.

use std::time::Duration;

use ferry_core::metrics::events::InternalEvent;
use metrics::{counter, gauge, histogram};
use tracing::trace;

// ============================================================================
// Sync lifecycle
// ============================================================================

/// A sync invocation acquired its lease and started.
pub struct SyncStarted {
    pub pipeline: String,
    /// "full", "incremental" or "chunked".
    pub sync_type: &'static str,
}

impl InternalEvent for SyncStarted {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, sync_type = self.sync_type, "Sync started");
        counter!(
            "ferry_syncs_started_total",
            "pipeline" => self.pipeline,
            "sync_type" => self.sync_type
        )
        .increment(1);
    }
}

/// A sync invocation finished, whatever its outcome.
pub struct SyncCompleted {
    pub pipeline: String,
    /// "success", "warning" or "error".
    pub status: &'static str,
}

impl InternalEvent for SyncCompleted {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, status = self.status, "Sync completed");
        counter!(
            "ferry_syncs_total",
            "pipeline" => self.pipeline,
            "status" => self.status
        )
        .increment(1);
    }
}

pub struct SyncDuration {
    pub pipeline: String,
    pub duration: Duration,
}

impl InternalEvent for SyncDuration {
    fn emit(self) {
        trace!(
            pipeline = %self.pipeline,
            duration_ms = self.duration.as_millis(),
            "Sync duration"
        );
        histogram!("ferry_sync_duration_seconds", "pipeline" => self.pipeline)
            .record(self.duration.as_secs_f64());
    }
}

/// A sync failed; labelled with the broad error category.
pub struct SyncFailed {
    pub pipeline: String,
    pub kind: &'static str,
}

impl InternalEvent for SyncFailed {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, kind = self.kind, "Sync failed");
        counter!(
            "ferry_sync_errors_total",
            "pipeline" => self.pipeline,
            "kind" => self.kind
        )
        .increment(1);
    }
}

// ============================================================================
// Extraction and staging
// ============================================================================

pub struct RowsExtracted {
    pub pipeline: String,
    pub count: u64,
}

impl InternalEvent for RowsExtracted {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, count = self.count, "Rows extracted");
        counter!("ferry_rows_extracted_total", "pipeline" => self.pipeline).increment(self.count);
    }
}

/// A batch was appended to a staging table.
pub struct BatchLoaded {
    pub pipeline: String,
    pub rows: u64,
}

impl InternalEvent for BatchLoaded {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, rows = self.rows, "Batch loaded");
        counter!("ferry_batches_loaded_total", "pipeline" => self.pipeline.clone()).increment(1);
        counter!("ferry_rows_staged_total", "pipeline" => self.pipeline).increment(self.rows);
    }
}

pub struct StagingTableDropped {
    pub pipeline: String,
}

impl InternalEvent for StagingTableDropped {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, "Staging table dropped");
        counter!("ferry_staging_tables_dropped_total", "pipeline" => self.pipeline).increment(1);
    }
}

/// Dropping a staging table failed; it is left to expire.
pub struct StagingCleanupFailed {
    pub pipeline: String,
}

impl InternalEvent for StagingCleanupFailed {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, "Staging cleanup failed");
        counter!("ferry_staging_cleanup_failures_total", "pipeline" => self.pipeline).increment(1);
    }
}

// ============================================================================
// Reconcile
// ============================================================================

pub struct ReconcileCompleted {
    pub pipeline: String,
    /// "merge" or "replace".
    pub mode: &'static str,
    pub rows: u64,
}

impl InternalEvent for ReconcileCompleted {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, mode = self.mode, rows = self.rows, "Reconcile completed");
        counter!(
            "ferry_rows_reconciled_total",
            "pipeline" => self.pipeline,
            "mode" => self.mode
        )
        .increment(self.rows);
    }
}

pub struct StaleRowsDeleted {
    pub pipeline: String,
    pub count: u64,
}

impl InternalEvent for StaleRowsDeleted {
    fn emit(self) {
        trace!(pipeline = %self.pipeline, count = self.count, "Stale rows deleted");
        counter!("ferry_stale_rows_deleted_total", "pipeline" => self.pipeline).increment(self.count);
    }
}

// ============================================================================
// Source pool
// ============================================================================

/// A transient source failure is being retried.
pub struct ConnectionRetried {
    /// "connect", "describe", "fetch" or "count".
    pub operation: &'static str,
    pub pool: String,
}

impl InternalEvent for ConnectionRetried {
    fn emit(self) {
        trace!(pool = %self.pool, operation = self.operation, "Source call retried");
        counter!(
            "ferry_source_retries_total",
            "pool" => self.pool,
            "operation" => self.operation
        )
        .increment(1);
    }
}

pub struct PoolConnections {
    pub pool: String,
    pub idle: usize,
    pub in_use: usize,
}

impl InternalEvent for PoolConnections {
    fn emit(self) {
        trace!(pool = %self.pool, idle = self.idle, in_use = self.in_use, "Pool connections");
        gauge!("ferry_pool_idle_connections", "pool" => self.pool.clone()).set(self.idle as f64);
        gauge!("ferry_pool_active_connections", "pool" => self.pool).set(self.in_use as f64);
    }
}
