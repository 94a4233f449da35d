//! SQLite source connector and warehouse.
//!
//! The warehouse keeps a `_ferry_catalog` table describing every table it
//! created (declared schema, partition column, expiry) and a
//! `_ferry_sync_records` table for the sync ledger. Staging tables carry an
//! expiry; expired ones are swept when the warehouse is opened and again
//! before every new staging table is created.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool with the
//! connection behind a mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params, params_from_iter};
use serde_json::Value as JsonValue;
use snafu::prelude::*;
use tracing::{debug, info};

use crate::credentials::ConnectionParams;
use crate::error::{
    CatalogSnafu, LedgerError, SourceError, SourceSqliteSnafu, SourceTaskSnafu, SqliteSnafu,
    RecordStoreSnafu, TaskSnafu, WarehouseError,
};
use crate::ledger::{SyncRecord, SyncRecordStore, SyncStatus};
use crate::schema::{ColumnDef, ColumnType, SourceColumn, TableSchema, map_type};
use crate::source::{ExtractQuery, SourceConnection, SourceConnector, SourceTableRef, quote_ident};
use crate::value::{Batch, RangeFilter, Record, Value};
use crate::warehouse::{DuplicateStats, MergeStats, TableOptions, TableStats, Warehouse};

const CATALOG_TABLE: &str = "_ferry_catalog";
const SYNC_RECORDS_TABLE: &str = "_ferry_sync_records";

const BOOTSTRAP: &str = r#"
CREATE TABLE IF NOT EXISTS _ferry_catalog (
    name TEXT PRIMARY KEY,
    schema TEXT NOT NULL,
    partition_column TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS _ferry_sync_records (
    sync_id TEXT PRIMARY KEY,
    pipeline TEXT NOT NULL,
    range_start TEXT,
    range_end TEXT,
    status TEXT NOT NULL,
    rows_processed INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    error_message TEXT
);
CREATE INDEX IF NOT EXISTS _ferry_sync_records_pipeline
    ON _ferry_sync_records (pipeline, status);
"#;

/// Fixed-width UTC timestamps so text comparison matches time order.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn declared_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Int64 | ColumnType::Bool => "INTEGER",
        ColumnType::Float64 => "REAL",
        _ => "TEXT",
    }
}

fn window_predicate(filter: &RangeFilter, qualifier: &str) -> String {
    let column = format!("{qualifier}{}", quote_ident(&filter.column));
    match filter.end {
        Some(end) => format!("date({column}) BETWEEN '{}' AND '{end}'", filter.start),
        None => format!("date({column}) >= '{}'", filter.start),
    }
}

fn key_match(keys: &[String], left: &str, right: &str) -> String {
    keys.iter()
        .map(|k| {
            let k = quote_ident(k);
            format!("{left}.{k} = {right}.{k}")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn column_list(columns: &[String], qualifier: &str) -> String {
    columns
        .iter()
        .map(|c| format!("{qualifier}{}", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn to_sql_value(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n
                .as_f64()
                .map_or_else(|| SqlValue::Text(n.to_string()), SqlValue::Real),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn to_json_value(value: ValueRef<'_>, column_type: ColumnType) -> JsonValue {
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) if column_type == ColumnType::Bool => JsonValue::Bool(i != 0),
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(JsonValue::Null, JsonValue::Number),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            JsonValue::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, WarehouseError> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n > 0)
    .context(SqliteSnafu)
}

/// Declared schema from the catalog, or from `PRAGMA table_info` for tables
/// created outside ferry.
fn schema_of(conn: &Connection, table: &str) -> Result<Option<TableSchema>, WarehouseError> {
    let cataloged: Option<String> = conn
        .query_row(
            &format!("SELECT schema FROM {CATALOG_TABLE} WHERE name = ?1"),
            [table],
            |row| row.get(0),
        )
        .optional()
        .context(SqliteSnafu)?;

    if let Some(json) = cataloged {
        let schema = serde_json::from_str(&json).context(CatalogSnafu { table })?;
        return Ok(Some(schema));
    }
    if !table_exists(conn, table)? {
        return Ok(None);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
        .context(SqliteSnafu)?;
    let columns = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let declared: String = row.get(2)?;
            let not_null: i64 = row.get(3)?;
            Ok(ColumnDef {
                name,
                column_type: map_type(&declared),
                nullable: not_null == 0,
            })
        })
        .context(SqliteSnafu)?
        .collect::<Result<Vec<_>, _>>()
        .context(SqliteSnafu)?;
    Ok(Some(TableSchema::new(columns)))
}

fn require_schema(conn: &Connection, table: &str) -> Result<TableSchema, WarehouseError> {
    schema_of(conn, table)?.ok_or_else(|| WarehouseError::TableNotFound {
        table: table.to_string(),
    })
}

fn drop_table_sync(conn: &Connection, table: &str) -> Result<bool, WarehouseError> {
    let existed = table_exists(conn, table)?;
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])
        .context(SqliteSnafu)?;
    conn.execute(&format!("DELETE FROM {CATALOG_TABLE} WHERE name = ?1"), [table])
        .context(SqliteSnafu)?;
    Ok(existed)
}

/// A warehouse stored in one SQLite database file. Clones share the connection.
#[derive(Clone)]
pub struct SqliteWarehouse {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteWarehouse {
    /// Open (or create) the database and sweep expired staging tables.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WarehouseError> {
        let conn = Connection::open(path).context(SqliteSnafu)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context(SqliteSnafu)?;
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> Result<Self, WarehouseError> {
        Self::bootstrap(Connection::open_in_memory().context(SqliteSnafu)?)
    }

    fn bootstrap(conn: Connection) -> Result<Self, WarehouseError> {
        conn.busy_timeout(Duration::from_secs(30))
            .context(SqliteSnafu)?;
        conn.execute_batch(BOOTSTRAP).context(SqliteSnafu)?;
        let swept = Self::sweep_sync(&conn, Utc::now())?;
        if !swept.is_empty() {
            info!(tables = ?swept, "Dropped expired staging tables");
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn sweep_sync(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<String>, WarehouseError> {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT name FROM {CATALOG_TABLE} WHERE expires_at IS NOT NULL AND expires_at <= ?1"
            ))
            .context(SqliteSnafu)?;
        let expired = stmt
            .query_map([timestamp(now)], |row| row.get::<_, String>(0))
            .context(SqliteSnafu)?
            .collect::<Result<Vec<_>, _>>()
            .context(SqliteSnafu)?;
        for table in &expired {
            drop_table_sync(conn, table)?;
        }
        Ok(expired)
    }

    async fn with_conn<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send + 'static,
        E: From<WarehouseError> + Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| WarehouseError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .context(TaskSnafu)
        .map_err(E::from)?
    }

    /// Names of user tables, excluding ferry's bookkeeping tables.
    pub async fn table_names(&self) -> Result<Vec<String>, WarehouseError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' \
                     AND name NOT LIKE '\\_ferry\\_%' ESCAPE '\\' \
                     AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' ORDER BY name",
                )
                .context(SqliteSnafu)?;
            stmt.query_map([], |row| row.get::<_, String>(0))
                .context(SqliteSnafu)?
                .collect::<Result<Vec<_>, _>>()
                .context(SqliteSnafu)
        })
        .await
    }

    /// All rows of a table in insertion order.
    pub async fn read_rows(&self, table: &str) -> Result<Vec<Record>, WarehouseError> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            let schema = require_schema(conn, &table)?;
            let names: Vec<String> = schema.column_names().map(str::to_string).collect();
            let sql = format!(
                "SELECT {} FROM {} ORDER BY rowid",
                column_list(&names, ""),
                quote_ident(&table)
            );
            let mut stmt = conn.prepare(&sql).context(SqliteSnafu)?;
            let mut rows = stmt.query([]).context(SqliteSnafu)?;
            let mut records = Vec::new();
            while let Some(row) = rows.next().context(SqliteSnafu)? {
                let mut record = Record::new();
                for (i, column) in schema.columns.iter().enumerate() {
                    let value = row.get_ref(i).context(SqliteSnafu)?;
                    record.insert(column.name.clone(), to_json_value(value, column.column_type));
                }
                records.push(record);
            }
            Ok(records)
        })
        .await
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    async fn table_schema(&self, table: &str) -> Result<Option<TableSchema>, WarehouseError> {
        let table = table.to_string();
        self.with_conn(move |conn| schema_of(conn, &table)).await
    }

    async fn create_table(
        &self,
        table: &str,
        schema: &TableSchema,
        options: &TableOptions,
    ) -> Result<(), WarehouseError> {
        let table = table.to_string();
        let schema = schema.clone();
        let options = options.clone();
        self.with_conn(move |conn| {
            if table_exists(conn, &table)? {
                return Err(WarehouseError::TableExists { table });
            }
            let columns: Vec<String> = schema
                .columns
                .iter()
                .map(|c| {
                    let not_null = if c.nullable { "" } else { " NOT NULL" };
                    format!("{} {}{not_null}", quote_ident(&c.name), declared_type(c.column_type))
                })
                .collect();
            let schema_json = serde_json::to_string(&schema).context(CatalogSnafu { table: &table })?;

            let tx = conn.transaction().context(SqliteSnafu)?;
            tx.execute(
                &format!("CREATE TABLE {} ({})", quote_ident(&table), columns.join(", ")),
                [],
            )
            .context(SqliteSnafu)?;
            if !options.cluster_columns.is_empty() {
                tx.execute(
                    &format!(
                        "CREATE INDEX {} ON {} ({})",
                        quote_ident(&format!("{table}__cluster")),
                        quote_ident(&table),
                        column_list(&options.cluster_columns, "")
                    ),
                    [],
                )
                .context(SqliteSnafu)?;
            }
            tx.execute(
                &format!(
                    "INSERT INTO {CATALOG_TABLE} (name, schema, partition_column, expires_at, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![
                    table,
                    schema_json,
                    options.partition_column,
                    options.expires_at.map(timestamp),
                    timestamp(Utc::now()),
                ],
            )
            .context(SqliteSnafu)?;
            tx.commit().context(SqliteSnafu)?;
            debug!(table = %table, columns = schema.columns.len(), "Created table");
            Ok(())
        })
        .await
    }

    async fn drop_table(&self, table: &str) -> Result<bool, WarehouseError> {
        let table = table.to_string();
        self.with_conn(move |conn| drop_table_sync(conn, &table)).await
    }

    async fn insert_rows(&self, table: &str, records: &[Record]) -> Result<(), WarehouseError> {
        let table = table.to_string();
        let records = records.to_vec();
        self.with_conn(move |conn| {
            let schema = require_schema(conn, &table)?;
            let names: Vec<String> = schema.column_names().map(str::to_string).collect();

            for record in &records {
                if let Some(column) = record.keys().find(|c| schema.column(c).is_none()) {
                    return Err(WarehouseError::UnknownColumn {
                        table: table.clone(),
                        column: column.clone(),
                    });
                }
            }

            let placeholders = vec!["?"; names.len()].join(", ");
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                quote_ident(&table),
                column_list(&names, "")
            );

            let tx = conn.transaction().context(SqliteSnafu)?;
            {
                let mut stmt = tx.prepare(&sql).context(SqliteSnafu)?;
                for record in &records {
                    let values = names
                        .iter()
                        .map(|c| record.get(c).map_or(SqlValue::Null, to_sql_value));
                    stmt.execute(params_from_iter(values)).context(SqliteSnafu)?;
                }
            }
            tx.commit().context(SqliteSnafu)
        })
        .await
    }

    async fn merge(
        &self,
        staging: &str,
        target: &str,
        keys: &[String],
    ) -> Result<MergeStats, WarehouseError> {
        let staging = staging.to_string();
        let target = target.to_string();
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            require_schema(conn, &staging)?;
            let schema = require_schema(conn, &target)?;
            let columns: Vec<String> = schema.column_names().map(str::to_string).collect();
            let updates: Vec<String> = columns
                .iter()
                .filter(|c| !keys.contains(c))
                .map(|c| format!("{0} = s.{0}", quote_ident(c)))
                .collect();
            let src = "temp._ferry_merge_source";
            let target_q = quote_ident(&target);
            let matched = key_match(&keys, "t", "s");

            let tx = conn.transaction().context(SqliteSnafu)?;
            tx.execute(&format!("DROP TABLE IF EXISTS {src}"), [])
                .context(SqliteSnafu)?;
            // Collapse staged duplicates: the row appended last wins.
            tx.execute(
                &format!(
                    "CREATE TEMP TABLE _ferry_merge_source AS SELECT * FROM {staging_q} \
                     WHERE rowid IN (SELECT MAX(rowid) FROM {staging_q} GROUP BY {group})",
                    staging_q = quote_ident(&staging),
                    group = column_list(&keys, ""),
                ),
                [],
            )
            .context(SqliteSnafu)?;

            let updated: i64 = tx
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {src} AS s WHERE EXISTS \
                         (SELECT 1 FROM {target_q} AS t WHERE {matched})"
                    ),
                    [],
                    |row| row.get(0),
                )
                .context(SqliteSnafu)?;

            if !updates.is_empty() {
                tx.execute(
                    &format!(
                        "UPDATE {target_q} AS t SET {} FROM {src} AS s WHERE {matched}",
                        updates.join(", ")
                    ),
                    [],
                )
                .context(SqliteSnafu)?;
            }

            let inserted = tx
                .execute(
                    &format!(
                        "INSERT INTO {target_q} ({cols}) SELECT {src_cols} FROM {src} AS s \
                         WHERE NOT EXISTS (SELECT 1 FROM {target_q} AS t WHERE {matched})",
                        cols = column_list(&columns, ""),
                        src_cols = column_list(&columns, "s."),
                    ),
                    [],
                )
                .context(SqliteSnafu)?;

            tx.execute(&format!("DROP TABLE {src}"), [])
                .context(SqliteSnafu)?;
            tx.commit().context(SqliteSnafu)?;

            Ok(MergeStats {
                inserted: inserted as u64,
                updated: u64::try_from(updated).unwrap_or_default(),
            })
        })
        .await
    }

    async fn replace(&self, staging: &str, target: &str) -> Result<u64, WarehouseError> {
        let staging = staging.to_string();
        let target = target.to_string();
        self.with_conn(move |conn| {
            require_schema(conn, &staging)?;
            let schema = require_schema(conn, &target)?;
            let columns: Vec<String> = schema.column_names().map(str::to_string).collect();
            let cols = column_list(&columns, "");

            let tx = conn.transaction().context(SqliteSnafu)?;
            tx.execute(&format!("DELETE FROM {}", quote_ident(&target)), [])
                .context(SqliteSnafu)?;
            let copied = tx
                .execute(
                    &format!(
                        "INSERT INTO {} ({cols}) SELECT {cols} FROM {} ORDER BY rowid",
                        quote_ident(&target),
                        quote_ident(&staging)
                    ),
                    [],
                )
                .context(SqliteSnafu)?;
            tx.commit().context(SqliteSnafu)?;
            Ok(copied as u64)
        })
        .await
    }

    async fn delete_stale(
        &self,
        staging: &str,
        target: &str,
        keys: &[String],
        window: &RangeFilter,
    ) -> Result<u64, WarehouseError> {
        let staging = staging.to_string();
        let target = target.to_string();
        let keys = keys.to_vec();
        let window = window.clone();
        self.with_conn(move |conn| {
            require_schema(conn, &staging)?;
            require_schema(conn, &target)?;
            let target_q = quote_ident(&target);
            let sql = format!(
                "DELETE FROM {target_q} WHERE {in_window} AND NOT EXISTS \
                 (SELECT 1 FROM {staging_q} AS s WHERE {matched})",
                in_window = window_predicate(&window, ""),
                staging_q = quote_ident(&staging),
                matched = key_match(&keys, &target_q, "s"),
            );
            let deleted = conn.execute(&sql, []).context(SqliteSnafu)?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn deduplicate(&self, table: &str, keys: &[String]) -> Result<u64, WarehouseError> {
        let table = table.to_string();
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            require_schema(conn, &table)?;
            let table_q = quote_ident(&table);
            let removed = conn
                .execute(
                    &format!(
                        "DELETE FROM {table_q} WHERE rowid NOT IN \
                         (SELECT MIN(rowid) FROM {table_q} GROUP BY {})",
                        column_list(&keys, "")
                    ),
                    [],
                )
                .context(SqliteSnafu)?;
            Ok(removed as u64)
        })
        .await
    }

    async fn duplicate_keys(&self, table: &str, keys: &[String]) -> Result<DuplicateStats, WarehouseError> {
        let table = table.to_string();
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            require_schema(conn, &table)?;
            let (groups, extra_rows): (i64, i64) = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*), COALESCE(SUM(n - 1), 0) FROM \
                         (SELECT COUNT(*) AS n FROM {} GROUP BY {} HAVING COUNT(*) > 1)",
                        quote_ident(&table),
                        column_list(&keys, "")
                    ),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .context(SqliteSnafu)?;
            Ok(DuplicateStats {
                groups: u64::try_from(groups).unwrap_or_default(),
                extra_rows: u64::try_from(extra_rows).unwrap_or_default(),
            })
        })
        .await
    }

    async fn count_rows(
        &self,
        table: &str,
        filter: Option<&RangeFilter>,
    ) -> Result<u64, WarehouseError> {
        let table = table.to_string();
        let filter = filter.cloned();
        self.with_conn(move |conn| {
            require_schema(conn, &table)?;
            let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&table));
            if let Some(filter) = &filter {
                sql.push_str(&format!(" WHERE {}", window_predicate(filter, "")));
            }
            let count: i64 = conn
                .query_row(&sql, [], |row| row.get(0))
                .context(SqliteSnafu)?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }

    async fn table_stats(
        &self,
        table: &str,
        freshness_column: &str,
    ) -> Result<TableStats, WarehouseError> {
        let table = table.to_string();
        let column = freshness_column.to_string();
        self.with_conn(move |conn| {
            let schema = require_schema(conn, &table)?;
            if schema.column(&column).is_none() {
                return Err(WarehouseError::UnknownColumn { table, column });
            }
            let sql = format!(
                "SELECT COUNT(*), MAX({}) FROM {}",
                quote_ident(&column),
                quote_ident(&table)
            );
            conn.query_row(&sql, [], |row| {
                let count: i64 = row.get(0)?;
                let latest = match row.get_ref(1)? {
                    ValueRef::Null => None,
                    ValueRef::Integer(i) => Some(i.to_string()),
                    ValueRef::Real(f) => Some(f.to_string()),
                    ValueRef::Text(b) | ValueRef::Blob(b) => {
                        Some(String::from_utf8_lossy(b).into_owned())
                    }
                };
                Ok(TableStats {
                    row_count: u64::try_from(count).unwrap_or_default(),
                    latest,
                })
            })
            .context(SqliteSnafu)
        })
        .await
    }

    async fn drop_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, WarehouseError> {
        self.with_conn(move |conn| Self::sweep_sync(conn, now)).await
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

// ============ Ledger ============

type RawRecord = (
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    i64,
    String,
    String,
    Option<String>,
);

fn decode_record(raw: RawRecord) -> Result<SyncRecord, LedgerError> {
    let (sync_id, pipeline, range_start, range_end, status, rows, created_at, updated_at, error_message) =
        raw;
    let invalid = |message: String| LedgerError::InvalidRecord {
        sync_id: sync_id.clone(),
        message,
    };
    let date = |s: Option<String>| -> Result<Option<NaiveDate>, LedgerError> {
        s.map(|s| s.parse::<NaiveDate>().map_err(|e| invalid(e.to_string())))
            .transpose()
    };
    let instant = |s: &str| -> Result<DateTime<Utc>, LedgerError> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| invalid(e.to_string()))
    };

    Ok(SyncRecord {
        range_start: date(range_start)?,
        range_end: date(range_end)?,
        status: status.parse::<SyncStatus>().map_err(invalid)?,
        rows_processed: u64::try_from(rows).unwrap_or_default(),
        created_at: instant(&created_at)?,
        updated_at: instant(&updated_at)?,
        error_message,
        pipeline,
        sync_id: sync_id.clone(),
    })
}

fn read_records(
    conn: &Connection,
    where_clause: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<RawRecord>, WarehouseError> {
    let sql = format!(
        "SELECT sync_id, pipeline, range_start, range_end, status, rows_processed, \
         created_at, updated_at, error_message FROM {SYNC_RECORDS_TABLE} WHERE {where_clause} \
         ORDER BY created_at, rowid"
    );
    let mut stmt = conn.prepare(&sql).context(SqliteSnafu)?;
    stmt.query_map(args, |row| {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ))
    })
    .context(SqliteSnafu)?
    .collect::<Result<Vec<_>, _>>()
    .context(SqliteSnafu)
}

fn lease_cutoff(now: DateTime<Utc>, stale_after: Duration) -> String {
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
    timestamp(now.checked_sub_signed(stale_after).unwrap_or(DateTime::<Utc>::MIN_UTC))
}

#[async_trait]
impl SyncRecordStore for SqliteWarehouse {
    async fn try_begin(&self, record: &SyncRecord, stale_after: Duration) -> Result<bool, LedgerError> {
        let record = record.clone();
        let now = timestamp(record.created_at);
        let cutoff = lease_cutoff(record.created_at, stale_after);
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context(SqliteSnafu)?;

            let live: i64 = tx
                .query_row(
                    &format!(
                        "SELECT COUNT(*) FROM {SYNC_RECORDS_TABLE} \
                         WHERE pipeline = ?1 AND status = 'PROCESSING' AND updated_at > ?2"
                    ),
                    params![record.pipeline, cutoff],
                    |row| row.get(0),
                )
                .context(SqliteSnafu)?;
            if live > 0 {
                return Ok(false);
            }

            let expired = tx
                .execute(
                    &format!(
                        "UPDATE {SYNC_RECORDS_TABLE} SET status = 'FAILED', \
                         error_message = 'lease expired', updated_at = ?2 \
                         WHERE pipeline = ?1 AND status = 'PROCESSING'"
                    ),
                    params![record.pipeline, now],
                )
                .context(SqliteSnafu)?;
            if expired > 0 {
                info!(pipeline = %record.pipeline, expired, "Took over stale sync lease");
            }

            tx.execute(
                &format!(
                    "INSERT INTO {SYNC_RECORDS_TABLE} (sync_id, pipeline, range_start, range_end, \
                     status, rows_processed, created_at, updated_at, error_message) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    record.sync_id,
                    record.pipeline,
                    record.range_start.map(|d| d.to_string()),
                    record.range_end.map(|d| d.to_string()),
                    record.status.as_str(),
                    i64::try_from(record.rows_processed).unwrap_or(i64::MAX),
                    timestamp(record.created_at),
                    timestamp(record.updated_at),
                    record.error_message,
                ],
            )
            .context(SqliteSnafu)?;
            tx.commit().context(SqliteSnafu)?;
            Ok(true)
        })
        .await
        .context(RecordStoreSnafu)
    }

    async fn update(&self, record: &SyncRecord) -> Result<(), LedgerError> {
        let record = record.clone();
        let changed = self
            .with_conn(move |conn| {
                let n = conn.execute(
                    &format!(
                        "UPDATE {SYNC_RECORDS_TABLE} SET status = ?2, rows_processed = ?3, \
                         updated_at = ?4, error_message = ?5 WHERE sync_id = ?1"
                    ),
                    params![
                        record.sync_id,
                        record.status.as_str(),
                        i64::try_from(record.rows_processed).unwrap_or(i64::MAX),
                        timestamp(record.updated_at),
                        record.error_message,
                    ],
                )
                .context(SqliteSnafu)?;
                Ok((n, record.sync_id))
            })
            .await
            .context(RecordStoreSnafu)?;

        match changed {
            (0, sync_id) => Err(LedgerError::InvalidRecord {
                sync_id,
                message: "no such record".to_string(),
            }),
            _ => Ok(()),
        }
    }

    async fn records(&self, pipeline: &str) -> Result<Vec<SyncRecord>, LedgerError> {
        let pipeline = pipeline.to_string();
        let raw = self
            .with_conn(move |conn| read_records(conn, "pipeline = ?1", &[&pipeline]))
            .await
            .context(RecordStoreSnafu)?;
        raw.into_iter().map(decode_record).collect()
    }

    async fn active_lease(
        &self,
        pipeline: &str,
        stale_after: Duration,
    ) -> Result<Option<SyncRecord>, LedgerError> {
        let pipeline = pipeline.to_string();
        let cutoff = lease_cutoff(Utc::now(), stale_after);
        let raw = self
            .with_conn(move |conn| {
                read_records(
                    conn,
                    "pipeline = ?1 AND status = 'PROCESSING' AND updated_at > ?2",
                    &[&pipeline, &cutoff],
                )
            })
            .await
            .context(RecordStoreSnafu)?;
        raw.into_iter().next().map(decode_record).transpose()
    }
}

// ============ Source ============

/// Opens read-only connections to a SQLite source database.
///
/// The database path comes from the `path` connection parameter.
#[derive(Debug, Clone, Default)]
pub struct SqliteSourceConnector;

#[async_trait]
impl SourceConnector for SqliteSourceConnector {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Box<dyn SourceConnection>, SourceError> {
        let path = params
            .get("path")
            .ok_or_else(|| SourceError::Connection {
                message: "connection parameter 'path' is not set".to_string(),
            })?
            .to_string();

        let conn = tokio::task::spawn_blocking(move || {
            Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(|e| SourceError::Connection {
                message: format!("failed to open '{path}': {e}"),
            })
        })
        .await
        .context(SourceTaskSnafu)??;

        conn.busy_timeout(Duration::from_secs(5))
            .context(SourceSqliteSnafu)?;
        Ok(Box::new(SqliteSourceConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }
}

struct SqliteSourceConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSourceConnection {
    async fn run<T, F>(&self, f: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, SourceError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| SourceError::Connection {
                message: "connection lock poisoned".to_string(),
            })?;
            f(&guard)
        })
        .await
        .context(SourceTaskSnafu)?
    }
}

/// Decode a SQLite value according to the column's declared source type.
fn decode_source_value(
    value: ValueRef<'_>,
    declared: Option<&str>,
    column: &str,
) -> Result<Value, SourceError> {
    let column_type = declared.map_or(ColumnType::String, map_type);
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match column_type {
            ColumnType::Bool => Value::Bool(i != 0),
            ColumnType::Numeric => Value::Decimal(i.to_string()),
            ColumnType::Float64 => Value::Float(i as f64),
            _ => Value::Int(i),
        },
        ValueRef::Real(f) => match column_type {
            ColumnType::Numeric => Value::Decimal(f.to_string()),
            _ => Value::Float(f),
        },
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(|e| SourceError::Decode {
                column: column.to_string(),
                message: e.to_string(),
            })?;
            decode_text(text, column_type)
        }
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    })
}

fn parse_naive_datetime(text: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

fn decode_text(text: &str, column_type: ColumnType) -> Value {
    let parsed = match column_type {
        ColumnType::Numeric => Some(Value::Decimal(text.to_string())),
        ColumnType::Int64 => text.parse().ok().map(Value::Int),
        ColumnType::Float64 => text.parse().ok().map(Value::Float),
        ColumnType::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        ColumnType::Date => text.parse::<NaiveDate>().ok().map(Value::Date),
        ColumnType::Time => text.parse::<NaiveTime>().ok().map(Value::Time),
        ColumnType::DateTime => parse_naive_datetime(text).map(Value::DateTime),
        ColumnType::Timestamp => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_naive_datetime(text).map(|dt| dt.and_utc()))
            .map(Value::Timestamp),
        ColumnType::Json => serde_json::from_str(text).ok().map(Value::Json),
        ColumnType::String => None,
    };
    parsed.unwrap_or_else(|| Value::String(text.to_string()))
}

#[async_trait]
impl SourceConnection for SqliteSourceConnection {
    async fn describe_table(
        &mut self,
        table: &SourceTableRef,
    ) -> Result<Vec<SourceColumn>, SourceError> {
        let table = table.clone();
        self.run(move |conn| {
            let pragma = match &table.schema {
                Some(schema) => format!("PRAGMA {}.table_info({})", quote_ident(schema), quote_ident(&table.name)),
                None => format!("PRAGMA table_info({})", quote_ident(&table.name)),
            };
            let mut stmt = conn.prepare(&pragma).context(SourceSqliteSnafu)?;
            let columns = stmt
                .query_map([], |row| Ok(SourceColumn::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
                .context(SourceSqliteSnafu)?
                .collect::<Result<Vec<_>, _>>()
                .context(SourceSqliteSnafu)?;
            if columns.is_empty() {
                return Err(SourceError::SourceTableNotFound {
                    table: table.to_string(),
                });
            }
            Ok(columns)
        })
        .await
    }

    async fn fetch(&mut self, query: &ExtractQuery) -> Result<Batch, SourceError> {
        let sql = query.to_sql();
        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql).context(SourceSqliteSnafu)?;
            let columns: Vec<(String, Option<String>)> = stmt
                .columns()
                .iter()
                .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
                .collect();

            let mut rows = stmt.query([]).context(SourceSqliteSnafu)?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().context(SourceSqliteSnafu)? {
                let mut values = Vec::with_capacity(columns.len());
                for (i, (name, declared)) in columns.iter().enumerate() {
                    let value = row.get_ref(i).context(SourceSqliteSnafu)?;
                    values.push(decode_source_value(value, declared.as_deref(), name)?);
                }
                out.push(values);
            }
            Ok(Batch::new(columns.into_iter().map(|(name, _)| name).collect(), out))
        })
        .await
    }

    async fn count(
        &mut self,
        table: &SourceTableRef,
        filter: Option<&RangeFilter>,
    ) -> Result<u64, SourceError> {
        let sql = ExtractQuery::count_sql(table, filter);
        self.run(move |conn| {
            let count: i64 = conn
                .query_row(&sql, [], |row| row.get(0))
                .context(SourceSqliteSnafu)?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }

    async fn ping(&mut self) -> Result<(), SourceError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .context(SourceSqliteSnafu)
        })
        .await
    }
}
