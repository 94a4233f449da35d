//! In-memory source, warehouse and ledger.
//!
//! These implement the same contracts as the SQLite backend and add fault
//! injection, so the sync protocol can be exercised end to end without I/O.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value as JsonValue;

use crate::credentials::ConnectionParams;
use crate::error::{LedgerError, SourceError, WarehouseError};
use crate::ledger::{SyncRecord, SyncRecordStore, SyncStatus};
use crate::schema::{SourceColumn, TableSchema};
use crate::source::{ExtractQuery, Page, SourceConnection, SourceConnector, SourceTableRef};
use crate::value::{Batch, RangeFilter, Record, Value};
use crate::warehouse::{DuplicateStats, MergeStats, TableOptions, TableStats, Warehouse};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn key_of(record: &Record, keys: &[String]) -> Vec<String> {
    keys.iter()
        .map(|k| record.get(k).map_or_else(|| "null".to_string(), JsonValue::to_string))
        .collect()
}

// ============ Warehouse ============

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    options: TableOptions,
    rows: Vec<Record>,
}

#[derive(Debug, Default)]
struct Faults {
    fail_insert_at: Option<usize>,
    fail_merge: bool,
    fail_replace: bool,
    fail_delete_stale: bool,
    fail_drop: bool,
}

#[derive(Debug, Default)]
struct WarehouseState {
    tables: IndexMap<String, MemTable>,
    inserts: usize,
    faults: Faults,
    created: Vec<String>,
    dropped: Vec<String>,
}

impl WarehouseState {
    fn table(&self, name: &str) -> Result<&MemTable, WarehouseError> {
        self.tables
            .get(name)
            .ok_or_else(|| WarehouseError::TableNotFound {
                table: name.to_string(),
            })
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable, WarehouseError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| WarehouseError::TableNotFound {
                table: name.to_string(),
            })
    }
}

/// A warehouse kept in process memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<WarehouseState>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table with rows, bypassing fault injection and counters.
    pub fn seed(&self, table: &str, schema: TableSchema, rows: Vec<Record>) {
        lock(&self.state).tables.insert(
            table.to_string(),
            MemTable {
                schema,
                options: TableOptions::default(),
                rows,
            },
        );
    }

    /// Rows of a table in storage order. Empty when the table does not exist.
    pub fn rows(&self, table: &str) -> Vec<Record> {
        lock(&self.state)
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        lock(&self.state).tables.contains_key(table)
    }

    pub fn table_names(&self) -> Vec<String> {
        lock(&self.state).tables.keys().cloned().collect()
    }

    /// Every table created through [`Warehouse::create_table`], in order.
    pub fn created_tables(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    /// Every table dropped through [`Warehouse::drop_table`], in order.
    pub fn dropped_tables(&self) -> Vec<String> {
        lock(&self.state).dropped.clone()
    }

    pub fn table_options(&self, table: &str) -> Option<TableOptions> {
        lock(&self.state).tables.get(table).map(|t| t.options.clone())
    }

    /// Remove tables whose expiry has passed. Returns their names.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut state = lock(&self.state);
        let expired: Vec<String> = state
            .tables
            .iter()
            .filter(|(_, t)| t.options.expires_at.is_some_and(|at| at <= now))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            state.tables.shift_remove(name);
        }
        expired
    }

    /// Fail the `n`th call to `insert_rows` (1-based, counted from creation).
    pub fn fail_insert_at(&self, n: usize) {
        lock(&self.state).faults.fail_insert_at = Some(n);
    }

    pub fn fail_merge(&self, fail: bool) {
        lock(&self.state).faults.fail_merge = fail;
    }

    pub fn fail_replace(&self, fail: bool) {
        lock(&self.state).faults.fail_replace = fail;
    }

    pub fn fail_delete_stale(&self, fail: bool) {
        lock(&self.state).faults.fail_delete_stale = fail;
    }

    pub fn fail_drop(&self, fail: bool) {
        lock(&self.state).faults.fail_drop = fail;
    }
}

fn injected(operation: &'static str, table: &str) -> WarehouseError {
    WarehouseError::InjectedFault {
        operation,
        table: table.to_string(),
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, WarehouseError> {
        Ok(lock(&self.state).tables.get(table).map(|t| t.schema.clone()))
    }

    async fn create_table(
        &self,
        table: &str,
        schema: &TableSchema,
        options: &TableOptions,
    ) -> Result<(), WarehouseError> {
        let mut state = lock(&self.state);
        if state.tables.contains_key(table) {
            return Err(WarehouseError::TableExists {
                table: table.to_string(),
            });
        }
        state.tables.insert(
            table.to_string(),
            MemTable {
                schema: schema.clone(),
                options: options.clone(),
                rows: Vec::new(),
            },
        );
        state.created.push(table.to_string());
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<bool, WarehouseError> {
        let mut state = lock(&self.state);
        if state.faults.fail_drop {
            return Err(injected("drop", table));
        }
        let existed = state.tables.shift_remove(table).is_some();
        if existed {
            state.dropped.push(table.to_string());
        }
        Ok(existed)
    }

    async fn insert_rows(&self, table: &str, records: &[Record]) -> Result<(), WarehouseError> {
        let mut state = lock(&self.state);
        state.inserts += 1;
        if state.faults.fail_insert_at == Some(state.inserts) {
            return Err(injected("insert", table));
        }

        let target = state.table_mut(table)?;
        let mut shaped = Vec::with_capacity(records.len());
        for record in records {
            if let Some(column) = record.keys().find(|c| target.schema.column(c).is_none()) {
                return Err(WarehouseError::UnknownColumn {
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
            shaped.push(
                target
                    .schema
                    .column_names()
                    .map(|c| (c.to_string(), record.get(c).cloned().unwrap_or(JsonValue::Null)))
                    .collect::<Record>(),
            );
        }
        target.rows.extend(shaped);
        Ok(())
    }

    async fn merge(
        &self,
        staging: &str,
        target: &str,
        keys: &[String],
    ) -> Result<MergeStats, WarehouseError> {
        let mut state = lock(&self.state);
        if state.faults.fail_merge {
            return Err(injected("merge", target));
        }

        // Last staged row per key wins.
        let mut staged: IndexMap<Vec<String>, Record> = IndexMap::new();
        for row in &state.table(staging)?.rows {
            staged.insert(key_of(row, keys), row.clone());
        }

        let target_table = state.table_mut(target)?;
        let mut stats = MergeStats::default();
        for (key, row) in staged {
            let mut matched = false;
            for existing in target_table
                .rows
                .iter_mut()
                .filter(|r| key_of(r, keys) == key)
            {
                for (column, value) in &row {
                    if existing.contains_key(column) {
                        existing.insert(column.clone(), value.clone());
                    }
                }
                matched = true;
            }
            if matched {
                stats.updated += 1;
            } else {
                target_table.rows.push(row);
                stats.inserted += 1;
            }
        }
        Ok(stats)
    }

    async fn replace(&self, staging: &str, target: &str) -> Result<u64, WarehouseError> {
        let mut state = lock(&self.state);
        if state.faults.fail_replace {
            return Err(injected("replace", target));
        }
        let rows = state.table(staging)?.rows.clone();
        let copied = rows.len() as u64;
        state.table_mut(target)?.rows = rows;
        Ok(copied)
    }

    async fn delete_stale(
        &self,
        staging: &str,
        target: &str,
        keys: &[String],
        window: &RangeFilter,
    ) -> Result<u64, WarehouseError> {
        let mut state = lock(&self.state);
        if state.faults.fail_delete_stale {
            return Err(injected("delete_stale", target));
        }
        let staged: HashSet<Vec<String>> = state
            .table(staging)?
            .rows
            .iter()
            .map(|r| key_of(r, keys))
            .collect();

        let target_table = state.table_mut(target)?;
        let before = target_table.rows.len();
        target_table.rows.retain(|row| {
            let in_window = row
                .get(&window.column)
                .is_some_and(|v| window.matches_json(v));
            !in_window || staged.contains(&key_of(row, keys))
        });
        Ok((before - target_table.rows.len()) as u64)
    }

    async fn deduplicate(&self, table: &str, keys: &[String]) -> Result<u64, WarehouseError> {
        let mut state = lock(&self.state);
        let target = state.table_mut(table)?;
        let mut seen = HashSet::new();
        let before = target.rows.len();
        target.rows.retain(|row| seen.insert(key_of(row, keys)));
        Ok((before - target.rows.len()) as u64)
    }

    async fn duplicate_keys(&self, table: &str, keys: &[String]) -> Result<DuplicateStats, WarehouseError> {
        let state = lock(&self.state);
        let target = state.table(table)?;
        if let Some(missing) = keys.iter().find(|k| target.schema.column(k).is_none()) {
            return Err(WarehouseError::UnknownColumn {
                table: table.to_string(),
                column: missing.clone(),
            });
        }
        let mut counts: HashMap<Vec<String>, u64> = HashMap::new();
        for row in &target.rows {
            *counts.entry(key_of(row, keys)).or_default() += 1;
        }
        Ok(counts
            .values()
            .filter(|&&n| n > 1)
            .fold(DuplicateStats::default(), |mut stats, n| {
                stats.groups += 1;
                stats.extra_rows += n - 1;
                stats
            }))
    }

    async fn count_rows(
        &self,
        table: &str,
        filter: Option<&RangeFilter>,
    ) -> Result<u64, WarehouseError> {
        let state = lock(&self.state);
        let rows = &state.table(table)?.rows;
        let count = match filter {
            Some(filter) => rows
                .iter()
                .filter(|r| r.get(&filter.column).is_some_and(|v| filter.matches_json(v)))
                .count(),
            None => rows.len(),
        };
        Ok(count as u64)
    }

    async fn table_stats(
        &self,
        table: &str,
        freshness_column: &str,
    ) -> Result<TableStats, WarehouseError> {
        let state = lock(&self.state);
        let target = state.table(table)?;
        if target.schema.column(freshness_column).is_none() {
            return Err(WarehouseError::UnknownColumn {
                table: table.to_string(),
                column: freshness_column.to_string(),
            });
        }
        let latest = target
            .rows
            .iter()
            .filter_map(|r| match r.get(freshness_column) {
                Some(JsonValue::String(s)) => Some(s.clone()),
                Some(JsonValue::Null) | None => None,
                Some(other) => Some(other.to_string()),
            })
            .max();
        Ok(TableStats {
            row_count: target.rows.len() as u64,
            latest,
        })
    }

    async fn drop_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, WarehouseError> {
        Ok(self.sweep_expired(now))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============ Ledger ============

/// Sync records kept in process memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    records: Arc<Mutex<Vec<SyncRecord>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record as-is, without lease checks.
    pub fn seed(&self, record: SyncRecord) {
        lock(&self.records).push(record);
    }

    pub fn all(&self) -> Vec<SyncRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl SyncRecordStore for MemoryLedger {
    async fn try_begin(&self, record: &SyncRecord, stale_after: Duration) -> Result<bool, LedgerError> {
        let mut records = lock(&self.records);
        let now = record.created_at;

        for existing in records.iter_mut().filter(|r| r.pipeline == record.pipeline) {
            if existing.holds_lease(now, stale_after) {
                return Ok(false);
            }
            if existing.is_stale_lease(now, stale_after) {
                existing.fail("lease expired", existing.rows_processed, now);
            }
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn update(&self, record: &SyncRecord) -> Result<(), LedgerError> {
        let mut records = lock(&self.records);
        match records.iter_mut().find(|r| r.sync_id == record.sync_id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(LedgerError::InvalidRecord {
                sync_id: record.sync_id.clone(),
                message: "no such record".to_string(),
            }),
        }
    }

    async fn records(&self, pipeline: &str) -> Result<Vec<SyncRecord>, LedgerError> {
        let mut records: Vec<SyncRecord> = lock(&self.records)
            .iter()
            .filter(|r| r.pipeline == pipeline)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn active_lease(
        &self,
        pipeline: &str,
        stale_after: Duration,
    ) -> Result<Option<SyncRecord>, LedgerError> {
        let now = Utc::now();
        Ok(lock(&self.records)
            .iter()
            .find(|r| r.pipeline == pipeline && r.status == SyncStatus::Processing && r.holds_lease(now, stale_after))
            .cloned())
    }
}

// ============ Source ============

#[derive(Debug, Clone)]
struct SourceTable {
    columns: Vec<SourceColumn>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct SourceState {
    tables: HashMap<String, SourceTable>,
    connects: usize,
    fail_connects: usize,
    fetches: usize,
    fail_fetch_at: Option<usize>,
    transient_fetch_failures: usize,
    fetch_delay: Option<Duration>,
}

/// A source warehouse kept in process memory. Clones share state.
///
/// Tables are looked up by name; the schema part of a [`SourceTableRef`] is
/// ignored.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    state: Arc<Mutex<SourceState>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, name: &str, columns: Vec<SourceColumn>, rows: Vec<Vec<Value>>) {
        lock(&self.state)
            .tables
            .insert(name.to_string(), SourceTable { columns, rows });
    }

    /// Replace a table's rows, keeping its columns.
    pub fn set_rows(&self, name: &str, rows: Vec<Vec<Value>>) {
        if let Some(table) = lock(&self.state).tables.get_mut(name) {
            table.rows = rows;
        }
    }

    /// Number of successful and failed connection attempts.
    pub fn connects(&self) -> usize {
        lock(&self.state).connects
    }

    /// Number of `fetch` calls, including failed ones.
    pub fn fetches(&self) -> usize {
        lock(&self.state).fetches
    }

    /// Fail the next `n` connection attempts with a transient error.
    pub fn fail_connects(&self, n: usize) {
        lock(&self.state).fail_connects = n;
    }

    /// Fail the `n`th fetch (1-based) with a non-transient query error.
    pub fn fail_fetch_at(&self, n: usize) {
        lock(&self.state).fail_fetch_at = Some(n);
    }

    /// Fail the next `n` fetches with a transient connection error.
    pub fn transient_fetch_failures(&self, n: usize) {
        lock(&self.state).transient_fetch_failures = n;
    }

    /// Sleep this long in every fetch.
    pub fn set_fetch_delay(&self, delay: Duration) {
        lock(&self.state).fetch_delay = Some(delay);
    }

    fn table(&self, table: &SourceTableRef) -> Result<SourceTable, SourceError> {
        lock(&self.state)
            .tables
            .get(&table.name)
            .cloned()
            .ok_or_else(|| SourceError::SourceTableNotFound {
                table: table.to_string(),
            })
    }
}

#[async_trait]
impl SourceConnector for MemorySource {
    async fn connect(
        &self,
        _params: &ConnectionParams,
    ) -> Result<Box<dyn SourceConnection>, SourceError> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(SourceError::Connection {
                message: "injected connect failure".to_string(),
            });
        }
        Ok(Box::new(MemoryConnection {
            source: self.clone(),
        }))
    }
}

struct MemoryConnection {
    source: MemorySource,
}

fn column_index(table: &SourceTable, column: &str) -> Result<usize, SourceError> {
    table
        .columns
        .iter()
        .position(|c| c.name == column)
        .ok_or_else(|| SourceError::Query {
            message: format!("unknown column '{column}'"),
        })
}

fn filter_rows(
    table: &SourceTable,
    filter: Option<&RangeFilter>,
) -> Result<Vec<Vec<Value>>, SourceError> {
    let Some(filter) = filter else {
        return Ok(table.rows.clone());
    };
    let index = column_index(table, &filter.column)?;
    Ok(table
        .rows
        .iter()
        .filter(|row| filter.matches(&row[index]))
        .cloned()
        .collect())
}

#[async_trait]
impl SourceConnection for MemoryConnection {
    async fn describe_table(
        &mut self,
        table: &SourceTableRef,
    ) -> Result<Vec<SourceColumn>, SourceError> {
        Ok(self.source.table(table)?.columns)
    }

    async fn fetch(&mut self, query: &ExtractQuery) -> Result<Batch, SourceError> {
        let delay = {
            let mut state = lock(&self.source.state);
            state.fetches += 1;
            if state.transient_fetch_failures > 0 {
                state.transient_fetch_failures -= 1;
                return Err(SourceError::Connection {
                    message: "injected transient fetch failure".to_string(),
                });
            }
            if state.fail_fetch_at == Some(state.fetches) {
                return Err(SourceError::Query {
                    message: "injected fetch failure".to_string(),
                });
            }
            state.fetch_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let table = self.source.table(&query.table)?;
        let mut rows = filter_rows(&table, query.filter.as_ref())?;

        if let Page::Cursor {
            column,
            after: Some(after),
            ..
        } = &query.page
        {
            let index = column_index(&table, column)?;
            rows.retain(|row| row[index].sort_cmp(after).is_gt());
        }

        let order: Vec<usize> = query
            .order_by
            .iter()
            .map(|c| column_index(&table, c))
            .collect::<Result<_, _>>()?;
        rows.sort_by(|a, b| {
            order
                .iter()
                .map(|&i| a[i].sort_cmp(&b[i]))
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let rows: Vec<Vec<Value>> = match &query.page {
            Page::Offset { offset, limit } => rows
                .into_iter()
                .skip(usize::try_from(*offset).unwrap_or(usize::MAX))
                .take(*limit)
                .collect(),
            Page::Cursor { limit, .. } => rows.into_iter().take(*limit).collect(),
            Page::All => rows,
        };

        let columns = table.columns.iter().map(|c| c.name.clone()).collect();
        Ok(Batch::new(columns, rows))
    }

    async fn count(
        &mut self,
        table: &SourceTableRef,
        filter: Option<&RangeFilter>,
    ) -> Result<u64, SourceError> {
        let table = self.source.table(table)?;
        Ok(filter_rows(&table, filter)?.len() as u64)
    }

    async fn ping(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
