//! Post-sync row-count validation.
//!
//! Compares the source row count with the target row count over the same
//! window. A difference above the threshold is a warning; failing to count
//! at all is reported in the summary and never fails the sync.

use serde::Serialize;
use tracing::{info, warn};

use crate::pool::SourcePool;
use crate::source::SourceTableRef;
use crate::value::RangeFilter;
use crate::warehouse::Warehouse;

/// Default tolerated difference between source and target counts.
pub const DEFAULT_VALIDATION_THRESHOLD_PERCENT: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub status: ValidationStatus,
    pub source_count: u64,
    pub target_count: u64,
    pub difference: u64,
    /// Difference relative to the source count, rounded to two decimals.
    pub difference_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationSummary {
    /// Classify a pair of counts against `threshold_percent`.
    pub fn compare(
        source_count: u64,
        target_count: u64,
        threshold_percent: f64,
        window: Option<&RangeFilter>,
    ) -> Self {
        let difference = source_count.abs_diff(target_count);
        let difference_percent = if source_count > 0 {
            (difference as f64 / source_count as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        let mut summary = Self {
            status: ValidationStatus::Success,
            source_count,
            target_count,
            difference,
            difference_percent,
            window: window.map(ToString::to_string),
            message: None,
        };
        if source_count > 0 && difference_percent > threshold_percent {
            summary.status = ValidationStatus::Warning;
            summary.message = Some(format!(
                "Row count difference ({difference_percent}%) exceeds threshold ({threshold_percent}%)"
            ));
        }
        summary
    }

    fn failed(message: String, window: Option<&RangeFilter>) -> Self {
        Self {
            status: ValidationStatus::Error,
            source_count: 0,
            target_count: 0,
            difference: 0,
            difference_percent: 0.0,
            window: window.map(ToString::to_string),
            message: Some(message),
        }
    }
}

/// Count both sides and summarize.
pub async fn validate_counts(
    pipeline: &str,
    pool: &SourcePool,
    warehouse: &dyn Warehouse,
    source: &SourceTableRef,
    target: &str,
    window: Option<&RangeFilter>,
    threshold_percent: f64,
) -> ValidationSummary {
    let source_count = match pool.count(source, window).await {
        Ok(count) => count,
        Err(e) => {
            warn!(target = %pipeline, error = %e, "Validation failed to count source rows");
            return ValidationSummary::failed(e.to_string(), window);
        }
    };
    let target_count = match warehouse.count_rows(target, window).await {
        Ok(count) => count,
        Err(e) => {
            warn!(target = %pipeline, error = %e, "Validation failed to count target rows");
            return ValidationSummary::failed(e.to_string(), window);
        }
    };

    let summary = ValidationSummary::compare(source_count, target_count, threshold_percent, window);
    info!(
        target = %pipeline,
        source_count,
        target_count,
        difference_percent = summary.difference_percent,
        status = ?summary.status,
        "Validation results"
    );
    summary
}
