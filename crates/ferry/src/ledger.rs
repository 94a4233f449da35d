//! Sync records: progress of chunked syncs and the per-pipeline lease.
//!
//! A record in `PROCESSING` state doubles as a lease. While one is fresh
//! (updated within the lease timeout), no other invocation of the same
//! pipeline may start, and the health monitor holds off its fallback trigger.
//! A record that stays `PROCESSING` past the timeout belonged to a crashed
//! run; the next invocation marks it `FAILED` and proceeds.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tracing::warn;

use crate::error::LedgerError;

/// Lifecycle of one sync record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    /// Not finished; the range is picked up again by the next run.
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Processing => "PROCESSING",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SyncStatus::Pending),
            "PROCESSING" => Ok(SyncStatus::Processing),
            "COMPLETED" => Ok(SyncStatus::Completed),
            "FAILED" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

/// One invocation's record in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub sync_id: String,
    pub pipeline: String,
    pub range_start: Option<NaiveDate>,
    pub range_end: Option<NaiveDate>,
    pub status: SyncStatus,
    pub rows_processed: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

impl SyncRecord {
    /// A new `PROCESSING` record.
    pub fn begin(
        pipeline: impl Into<String>,
        range: Option<(NaiveDate, NaiveDate)>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            sync_id: uuid::Uuid::new_v4().to_string(),
            pipeline: pipeline.into(),
            range_start: range.map(|(start, _)| start),
            range_end: range.map(|(_, end)| end),
            status: SyncStatus::Processing,
            rows_processed: 0,
            created_at: now,
            updated_at: now,
            error_message: None,
        }
    }

    pub fn finish(&mut self, status: SyncStatus, rows: u64, now: DateTime<Utc>) {
        self.status = status;
        self.rows_processed = rows;
        self.updated_at = now;
    }

    pub fn fail(&mut self, message: impl Into<String>, rows: u64, now: DateTime<Utc>) {
        self.finish(SyncStatus::Failed, rows, now);
        self.error_message = Some(message.into());
    }

    /// Whether this record is a live lease at `now`.
    pub fn holds_lease(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        self.status == SyncStatus::Processing && now.signed_duration_since(self.updated_at) < stale_after
    }

    /// Whether this record is an abandoned lease at `now`.
    pub fn is_stale_lease(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == SyncStatus::Processing && !self.holds_lease(now, stale_after)
    }
}

/// Durable storage for sync records.
#[async_trait]
pub trait SyncRecordStore: Send + Sync {
    /// Insert `record` as the pipeline's lease, atomically.
    ///
    /// Refuses (returns `false`) when another record for the same pipeline
    /// holds a live lease. Stale leases are marked `FAILED` first.
    async fn try_begin(&self, record: &SyncRecord, stale_after: Duration) -> Result<bool, LedgerError>;

    /// Overwrite a record by `sync_id`.
    async fn update(&self, record: &SyncRecord) -> Result<(), LedgerError>;

    /// Every record of a pipeline, oldest first.
    async fn records(&self, pipeline: &str) -> Result<Vec<SyncRecord>, LedgerError>;

    /// The live lease of a pipeline, if any.
    async fn active_lease(
        &self,
        pipeline: &str,
        stale_after: Duration,
    ) -> Result<Option<SyncRecord>, LedgerError>;
}

/// Releases a taken lease on drop unless disarmed.
///
/// An invocation whose future is dropped mid-run (client disconnect,
/// shutdown) never reaches its ledger update. The guard marks its record
/// `FAILED` with "cancelled" on a spawned task so the pipeline is not
/// blocked until the lease times out.
pub struct LeaseGuard {
    ledger: Option<Arc<dyn SyncRecordStore>>,
    record: SyncRecord,
}

impl LeaseGuard {
    pub fn new(ledger: Arc<dyn SyncRecordStore>, record: SyncRecord) -> Self {
        Self {
            ledger: Some(ledger),
            record,
        }
    }

    pub fn disarm(mut self) {
        self.ledger = None;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(ledger) = self.ledger.take() else {
            return;
        };
        let mut record = self.record.clone();
        record.fail("cancelled", 0, Utc::now());
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(target = %record.pipeline, sync_id = %record.sync_id, "No runtime to release lease; left to expire");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = ledger.update(&record).await {
                warn!(
                    target = %record.pipeline,
                    sync_id = %record.sync_id,
                    error = %e,
                    "Failed to release cancelled lease; left to expire"
                );
            }
        });
    }
}

/// How a progressive sync splits its history into ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chunking {
    #[serde(default = "default_chunk_days")]
    pub chunk_days: u32,
    /// Where the first range starts when the ledger is empty.
    #[serde(default = "default_lookback_days")]
    pub initial_lookback_days: u32,
    /// Ranges never extend past today plus this many days.
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
}

fn default_chunk_days() -> u32 {
    7
}

fn default_lookback_days() -> u32 {
    90
}

fn default_horizon_days() -> u32 {
    90
}

impl Default for Chunking {
    fn default() -> Self {
        Self {
            chunk_days: default_chunk_days(),
            initial_lookback_days: default_lookback_days(),
            horizon_days: default_horizon_days(),
        }
    }
}

/// The next range a progressive sync should process, or `None` when it has
/// caught up with the horizon.
///
/// The range starts the day after the latest completed range, so pending and
/// failed ranges are retried.
pub fn next_chunk(
    records: &[SyncRecord],
    today: NaiveDate,
    chunking: &Chunking,
) -> Option<(NaiveDate, NaiveDate)> {
    let horizon = today.checked_add_days(Days::new(u64::from(chunking.horizon_days)))?;

    let start = records
        .iter()
        .filter(|r| r.status == SyncStatus::Completed)
        .filter_map(|r| r.range_end)
        .max()
        .and_then(|end| end.succ_opt())
        .or_else(|| today.checked_sub_days(Days::new(u64::from(chunking.initial_lookback_days))))?;

    if start > horizon {
        return None;
    }

    let span = u64::from(chunking.chunk_days.max(1) - 1);
    let end = start.checked_add_days(Days::new(span))?.min(horizon);
    Some((start, end))
}
