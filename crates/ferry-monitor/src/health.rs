//! Freshness probing and health classification.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use snafu::prelude::*;

use ferry::Warehouse;

use crate::checks::{DuplicateHealth, OrchestrationHealth};
use crate::config::MonitoredTable;
use crate::error::{ProbeError, StatsSnafu, UnparseableLatestSnafu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Warning,
    Critical,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Critical => "CRITICAL",
            HealthStatus::Error => "ERROR",
        }
    }

    /// Gauge value for metrics.
    pub fn level(&self) -> u8 {
        match self {
            HealthStatus::Ok => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
            HealthStatus::Error => 3,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a probe read from the warehouse.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub row_count: u64,
    /// Latest freshness value as stored.
    pub latest_raw: Option<String>,
    pub latest: Option<DateTime<Utc>>,
}

/// Parse a stored freshness value: RFC 3339, a naive datetime (taken as
/// UTC), or a plain date (midnight UTC).
///
/// ```
/// use ferry_monitor::health::parse_latest;
///
/// assert!(parse_latest("2024-03-15").is_some());
/// assert!(parse_latest("2024-03-15T08:00:00Z").is_some());
/// assert!(parse_latest("2024-03-15 08:00:00.123").is_some());
/// assert!(parse_latest("yesterday").is_none());
/// ```
pub fn parse_latest(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| dt.and_utc())
        .or_else(|| {
            value
                .parse::<NaiveDate>()
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        })
}

/// Read row count and latest freshness value of a table.
pub async fn probe(warehouse: &dyn Warehouse, table: &MonitoredTable) -> Result<Probe, ProbeError> {
    let stats = warehouse
        .table_stats(&table.target_table, &table.freshness_column)
        .await
        .context(StatsSnafu {
            table: &table.target_table,
        })?;

    let latest = match &stats.latest {
        Some(raw) => Some(parse_latest(raw).context(UnparseableLatestSnafu {
            table: &table.target_table,
            value: raw,
        })?),
        None => None,
    };

    Ok(Probe {
        row_count: stats.row_count,
        latest_raw: stats.latest,
        latest,
    })
}

/// Health of one table at one poll.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableHealth {
    pub table: String,
    pub target_table: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<String>,
    /// Whole calendar days between the latest value and now.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_behind: Option<i64>,
    #[serde(skip)]
    pub lag_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orchestration: Option<OrchestrationHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicates: Option<DuplicateHealth>,
}

impl TableHealth {
    /// Fold the supplementary checks into the overall status and message.
    ///
    /// The status becomes the worst of all checks; the message lists every
    /// check that is not OK, freshness first.
    pub fn fold_checks(&mut self) {
        let failing: Vec<(HealthStatus, &str)> = [
            self.orchestration.as_ref().map(|o| (o.status, o.message.as_str())),
            self.duplicates.as_ref().map(|d| (d.status, d.message.as_str())),
        ]
        .into_iter()
        .flatten()
        .filter(|(status, _)| *status != HealthStatus::Ok)
        .collect();
        if failing.is_empty() {
            return;
        }

        let mut messages = Vec::new();
        if self.status != HealthStatus::Ok {
            messages.push(self.message.clone());
        }
        messages.extend(failing.iter().map(|(_, message)| message.to_string()));
        let worst = failing.iter().map(|(status, _)| *status).max().unwrap_or(HealthStatus::Ok);

        self.status = self.status.max(worst);
        self.message = messages.join("; ");
    }
}

/// Classify a probe result against the table's thresholds.
pub fn classify(
    key: &str,
    table: &MonitoredTable,
    probe: Result<Probe, ProbeError>,
    now: DateTime<Utc>,
) -> TableHealth {
    let mut health = TableHealth {
        table: key.to_string(),
        target_table: table.target_table.clone(),
        status: HealthStatus::Ok,
        latest: None,
        days_behind: None,
        lag_seconds: None,
        row_count: None,
        message: String::new(),
        orchestration: None,
        duplicates: None,
    };

    let probe = match probe {
        Ok(probe) => probe,
        Err(e) => {
            health.status = HealthStatus::Error;
            health.message = e.to_string();
            return health;
        }
    };
    health.row_count = Some(probe.row_count);
    health.latest = probe.latest_raw;

    let Some(latest) = probe.latest else {
        health.status = HealthStatus::Critical;
        health.message = format!("{} has no value in {}", table.target_table, table.freshness_column);
        return health;
    };
    let days_behind = now
        .date_naive()
        .signed_duration_since(latest.date_naive())
        .num_days();
    health.days_behind = Some(days_behind);
    health.lag_seconds = Some((now - latest).num_milliseconds().max(0) as f64 / 1000.0);

    if probe.row_count < table.min_row_count {
        health.status = HealthStatus::Critical;
        health.message = format!(
            "{} has {} rows, below the minimum of {}",
            table.target_table, probe.row_count, table.min_row_count
        );
    } else if days_behind > i64::from(table.critical_threshold_days) {
        health.status = HealthStatus::Critical;
        health.message = format!(
            "Data in {} is {days_behind} days behind (critical threshold {} exceeded)",
            table.target_table, table.critical_threshold_days
        );
    } else if days_behind > i64::from(table.warning_threshold_days) {
        health.status = HealthStatus::Warning;
        health.message = format!(
            "Data in {} is {days_behind} days behind (warning threshold {} exceeded)",
            table.target_table, table.warning_threshold_days
        );
    } else {
        health.message = format!("{} is {days_behind} days behind", table.target_table);
    }
    health
}
