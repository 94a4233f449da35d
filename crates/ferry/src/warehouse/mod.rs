//! Destination warehouse abstraction.
//!
//! The orchestrator, staging loader and reconciler only talk to a warehouse
//! through the [`Warehouse`] trait, so the same sync protocol runs against the
//! SQLite backend in production-like setups and the in-memory backend in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::WarehouseError;
use crate::schema::TableSchema;
use crate::value::{RangeFilter, Record};

/// Physical options for a newly created table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableOptions {
    /// The table is removed by the backend once this instant has passed.
    pub expires_at: Option<DateTime<Utc>>,
    pub partition_column: Option<String>,
    pub cluster_columns: Vec<String>,
}

/// Row counts from a MERGE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: u64,
    pub updated: u64,
}

/// Key groups holding more than one row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateStats {
    pub groups: u64,
    /// Rows beyond the first of each group, i.e. what `deduplicate` would remove.
    pub extra_rows: u64,
}

/// Recency and size of a table, used by the health monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub row_count: u64,
    /// Largest value of the freshness column, as stored.
    pub latest: Option<String>,
}

/// Operations a destination warehouse must support.
///
/// Every reconcile operation (`merge`, `replace`, `delete_stale`,
/// `deduplicate`) is a single atomic statement or transaction: either all of
/// its effects are visible afterwards or none are.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Schema of an existing table, `None` when the table does not exist.
    async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, WarehouseError>;

    /// Create a table. Creating a table that already exists is an error.
    async fn create_table(
        &self,
        table: &str,
        schema: &TableSchema,
        options: &TableOptions,
    ) -> Result<(), WarehouseError>;

    /// Drop a table. Returns whether it existed.
    async fn drop_table(&self, table: &str) -> Result<bool, WarehouseError>;

    /// Append records. The batch becomes visible all at once or not at all.
    async fn insert_rows(&self, table: &str, records: &[Record]) -> Result<(), WarehouseError>;

    /// Upsert every staged row into `target` by `keys`.
    ///
    /// Staged rows sharing a key collapse to the last one appended. Target rows
    /// with a matching key are updated in place; the rest are inserted.
    async fn merge(
        &self,
        staging: &str,
        target: &str,
        keys: &[String],
    ) -> Result<MergeStats, WarehouseError>;

    /// Replace the contents of `target` with the contents of `staging`.
    /// Returns the number of rows copied.
    async fn replace(&self, staging: &str, target: &str) -> Result<u64, WarehouseError>;

    /// Delete target rows inside `window` whose key is absent from `staging`.
    async fn delete_stale(
        &self,
        staging: &str,
        target: &str,
        keys: &[String],
        window: &RangeFilter,
    ) -> Result<u64, WarehouseError>;

    /// Keep one row per key group. Returns the number of rows removed.
    async fn deduplicate(&self, table: &str, keys: &[String]) -> Result<u64, WarehouseError>;

    /// Count key groups with more than one row, without changing the table.
    async fn duplicate_keys(&self, table: &str, keys: &[String]) -> Result<DuplicateStats, WarehouseError>;

    /// Count rows, optionally within a date window.
    async fn count_rows(
        &self,
        table: &str,
        filter: Option<&RangeFilter>,
    ) -> Result<u64, WarehouseError>;

    /// Row count and the largest value of `freshness_column`.
    async fn table_stats(
        &self,
        table: &str,
        freshness_column: &str,
    ) -> Result<TableStats, WarehouseError>;

    /// Drop every table whose expiry is at or before `now`. Returns their names.
    async fn drop_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, WarehouseError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}
