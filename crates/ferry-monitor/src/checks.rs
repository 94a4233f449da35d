//! Checks that run alongside freshness: the pipeline's sync history in the
//! ledger, and duplicate keys in the target table.
//!
//! Each produces its own status. The table's overall status is the worst of
//! freshness and these.

use chrono::{DateTime, Utc};
use serde::Serialize;

use ferry::ledger::{SyncRecord, SyncStatus};
use ferry::warehouse::DuplicateStats;

use crate::config::OrchestrationConfig;
use crate::health::HealthStatus;

/// Sync history of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestrationHealth {
    pub pipeline: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed: Option<DateTime<Utc>>,
    /// Failed runs since the last completed one. Runs still in flight are skipped.
    pub consecutive_failures: u32,
    pub message: String,
}

impl OrchestrationHealth {
    pub fn error(pipeline: &str, message: String) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            status: HealthStatus::Error,
            last_completed: None,
            consecutive_failures: 0,
            message,
        }
    }
}

/// Judge a pipeline's records (oldest first) against its expectations.
///
/// Too many failures in a row is critical. No completed sync within the
/// expected interval is a warning.
pub fn assess_orchestration(
    pipeline: &str,
    records: &[SyncRecord],
    config: &OrchestrationConfig,
    now: DateTime<Utc>,
) -> OrchestrationHealth {
    let last_completed = records
        .iter()
        .rev()
        .find(|r| r.status == SyncStatus::Completed)
        .map(|r| r.updated_at);

    let failures: Vec<&SyncRecord> = records
        .iter()
        .rev()
        .filter(|r| matches!(r.status, SyncStatus::Completed | SyncStatus::Failed))
        .take_while(|r| r.status == SyncStatus::Failed)
        .collect();
    let consecutive_failures = u32::try_from(failures.len()).unwrap_or(u32::MAX);

    let (status, message) = if consecutive_failures >= config.max_consecutive_failures {
        let latest = failures
            .first()
            .and_then(|r| r.error_message.as_deref())
            .unwrap_or("no error recorded");
        (
            HealthStatus::Critical,
            format!("Last {consecutive_failures} syncs of {pipeline} failed (latest: {latest})"),
        )
    } else {
        match last_completed {
            Some(at) if now - at <= config.expected_interval() => {
                (HealthStatus::Ok, format!("{pipeline} last completed at {at}"))
            }
            Some(at) => (
                HealthStatus::Warning,
                format!(
                    "No sync of {pipeline} completed since {at} (expected every {}h)",
                    config.expected_interval_hours
                ),
            ),
            None => (
                HealthStatus::Warning,
                format!("No completed sync of {pipeline} recorded"),
            ),
        }
    };

    OrchestrationHealth {
        pipeline: pipeline.to_string(),
        status,
        last_completed,
        consecutive_failures,
        message,
    }
}

/// Duplicate keys found in a target table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateHealth {
    pub status: HealthStatus,
    pub groups: u64,
    pub extra_rows: u64,
    /// Extra rows as a percentage of the row count.
    pub percent: f64,
    pub message: String,
}

impl DuplicateHealth {
    pub fn error(message: String) -> Self {
        Self {
            status: HealthStatus::Error,
            groups: 0,
            extra_rows: 0,
            percent: 0.0,
            message,
        }
    }
}

/// Judge duplicate counts against the tolerated percentage.
pub fn assess_duplicates(
    target_table: &str,
    stats: DuplicateStats,
    row_count: u64,
    threshold_percent: f64,
) -> DuplicateHealth {
    let percent = stats.extra_rows as f64 * 100.0 / row_count.max(1) as f64;
    let status = if stats.extra_rows > 0 && percent > threshold_percent {
        HealthStatus::Warning
    } else {
        HealthStatus::Ok
    };
    let message = if stats.extra_rows == 0 {
        format!("{target_table} has no duplicate keys")
    } else {
        format!(
            "{target_table} has {} duplicate row(s) across {} key(s) ({percent:.2}%, threshold {threshold_percent}%)",
            stats.extra_rows, stats.groups
        )
    };
    DuplicateHealth {
        status,
        groups: stats.groups,
        extra_rows: stats.extra_rows,
        percent,
        message,
    }
}
