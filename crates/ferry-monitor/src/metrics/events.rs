//! Internal events for monitor metrics.
//!
//! Every per-table event carries a `table` label (the configured table key).

use ferry_core::metrics::events::InternalEvent;
use metrics::{counter, gauge};
use tracing::trace;

/// Seconds since the freshness column's latest value.
pub struct TableFreshness {
    pub table: String,
    pub lag_seconds: f64,
}

impl InternalEvent for TableFreshness {
    fn emit(self) {
        trace!(table = %self.table, lag_seconds = self.lag_seconds, "Table freshness");
        gauge!("ferry_monitor_freshness_lag_seconds", "table" => self.table).set(self.lag_seconds);
    }
}

pub struct TableRowCount {
    pub table: String,
    pub rows: u64,
}

impl InternalEvent for TableRowCount {
    fn emit(self) {
        trace!(table = %self.table, rows = self.rows, "Table row count");
        gauge!("ferry_monitor_row_count", "table" => self.table).set(self.rows as f64);
    }
}

/// Rows beyond the first of each duplicated key.
pub struct TableDuplicateRows {
    pub table: String,
    pub rows: u64,
}

impl InternalEvent for TableDuplicateRows {
    fn emit(self) {
        trace!(table = %self.table, rows = self.rows, "Table duplicate rows");
        gauge!("ferry_monitor_duplicate_rows", "table" => self.table).set(self.rows as f64);
    }
}

/// Failed syncs since the pipeline last completed one.
pub struct PipelineFailureStreak {
    pub table: String,
    pub failures: u32,
}

impl InternalEvent for PipelineFailureStreak {
    fn emit(self) {
        trace!(table = %self.table, failures = self.failures, "Pipeline failure streak");
        gauge!("ferry_monitor_consecutive_failures", "table" => self.table).set(f64::from(self.failures));
    }
}

/// Health classification, as 0 (OK) to 3 (ERROR).
pub struct TableHealthStatus {
    pub table: String,
    pub level: u8,
}

impl InternalEvent for TableHealthStatus {
    fn emit(self) {
        trace!(table = %self.table, level = self.level, "Table health");
        gauge!("ferry_monitor_health_status", "table" => self.table).set(f64::from(self.level));
    }
}

/// A fallback sync was requested.
pub struct FallbackTriggered {
    pub table: String,
    /// "accepted", "failed" or "skipped".
    pub result: &'static str,
}

impl InternalEvent for FallbackTriggered {
    fn emit(self) {
        trace!(table = %self.table, result = self.result, "Fallback triggered");
        counter!(
            "ferry_monitor_fallbacks_total",
            "table" => self.table,
            "result" => self.result
        )
        .increment(1);
    }
}

pub struct AlertEmitted {
    pub severity: &'static str,
}

impl InternalEvent for AlertEmitted {
    fn emit(self) {
        trace!(severity = self.severity, "Alert emitted");
        counter!("ferry_monitor_alerts_total", "severity" => self.severity).increment(1);
    }
}
