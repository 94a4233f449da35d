//! Staging tables: one short-lived table per sync invocation.
//!
//! A staging table is created with the target's columns (all nullable) and an
//! expiry, filled batch by batch in extraction order, reconciled once, and
//! dropped. The expiry bounds how long a table can outlive a crashed run:
//! every `create` first drops whatever tables in the warehouse have expired.
//!
//! Nothing reads a staging table until every append of the invocation has
//! succeeded; an append error aborts the invocation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ferry_core::emit;
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{AppendSnafu, CreateStagingSnafu, DropStagingSnafu, StagingError, WarehouseError};
use crate::metrics::events::{BatchLoaded, StagingCleanupFailed, StagingTableDropped};
use crate::schema::TableSchema;
use crate::value::Record;
use crate::warehouse::{TableOptions, Warehouse};

/// Default lifetime of a staging table.
pub const DEFAULT_STAGING_EXPIRATION: Duration = Duration::from_secs(2 * 3600);

/// A staging table owned by one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTable {
    pub name: String,
    pub target: String,
    pub expires_at: DateTime<Utc>,
    /// Batches appended so far.
    pub batches: u64,
    /// Rows appended so far.
    pub rows: u64,
}

/// Staging table name for `target`: `{target}__staging_{8 hex chars}`.
pub fn staging_table_name(target: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{target}__staging_{}", &id[..8])
}

/// Creates, fills and drops staging tables for one pipeline.
#[derive(Clone)]
pub struct StagingLoader {
    warehouse: Arc<dyn Warehouse>,
    pipeline: String,
    expiration: Duration,
}

impl StagingLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, pipeline: impl Into<String>, expiration: Duration) -> Self {
        Self {
            warehouse,
            pipeline: pipeline.into(),
            expiration,
        }
    }

    /// Create a fresh staging table shaped like `schema`, after sweeping
    /// expired tables.
    pub async fn create(
        &self,
        target: &str,
        schema: &TableSchema,
        now: DateTime<Utc>,
    ) -> Result<StagingTable, StagingError> {
        self.sweep_expired(now).await;

        let name = staging_table_name(target);
        let lifetime = chrono::Duration::from_std(self.expiration).unwrap_or(chrono::Duration::hours(2));
        let expires_at = now + lifetime;

        let options = TableOptions {
            expires_at: Some(expires_at),
            ..TableOptions::default()
        };
        self.warehouse
            .create_table(&name, &schema.nullable_copy(), &options)
            .await
            .context(CreateStagingSnafu { table: &name })?;

        info!(
            target = %self.pipeline,
            staging = %name,
            expires_at = %expires_at,
            "Created staging table"
        );

        Ok(StagingTable {
            name,
            target: target.to_string(),
            expires_at,
            batches: 0,
            rows: 0,
        })
    }

    /// Drop tables whose expiry has passed. A failed sweep is only logged;
    /// the next `create` tries again.
    async fn sweep_expired(&self, now: DateTime<Utc>) {
        match self.warehouse.drop_expired(now).await {
            Ok(swept) => {
                for table in &swept {
                    emit!(StagingTableDropped {
                        pipeline: self.pipeline.clone(),
                    });
                    info!(target = %self.pipeline, staging = %table, "Dropped expired staging table");
                }
            }
            Err(e) => warn!(target = %self.pipeline, error = %e, "Expired staging sweep failed"),
        }
    }

    /// Append one batch. Empty batches are a no-op.
    pub async fn append(&self, table: &mut StagingTable, records: &[Record]) -> Result<(), StagingError> {
        if records.is_empty() {
            return Ok(());
        }
        let batch = table.batches + 1;
        self.warehouse
            .insert_rows(&table.name, records)
            .await
            .context(AppendSnafu {
                table: &table.name,
                batch,
            })?;

        table.batches = batch;
        table.rows += records.len() as u64;

        emit!(BatchLoaded {
            pipeline: self.pipeline.clone(),
            rows: records.len() as u64,
        });
        debug!(
            target = %self.pipeline,
            staging = %table.name,
            batch,
            rows = records.len(),
            total_rows = table.rows,
            "Appended batch to staging"
        );
        Ok(())
    }

    /// Drop the staging table. A table that is already gone is not an error.
    pub async fn dispose(&self, table: &StagingTable) -> Result<(), StagingError> {
        dispose_table(self.warehouse.as_ref(), &self.pipeline, &table.name).await
    }

    /// Arm a guard that drops the table if the invocation is abandoned before
    /// [`StagingGuard::disarm`].
    pub fn guard(&self, table: &StagingTable) -> StagingGuard {
        StagingGuard {
            warehouse: Some(self.warehouse.clone()),
            pipeline: self.pipeline.clone(),
            table: table.name.clone(),
        }
    }
}

async fn dispose_table(warehouse: &dyn Warehouse, pipeline: &str, table: &str) -> Result<(), StagingError> {
    match warehouse.drop_table(table).await {
        Ok(existed) => {
            emit!(StagingTableDropped {
                pipeline: pipeline.to_string(),
            });
            info!(target = %pipeline, staging = %table, existed, "Dropped staging table");
            Ok(())
        }
        Err(WarehouseError::TableNotFound { .. }) => Ok(()),
        Err(source) => Err(source).context(DropStagingSnafu { table }),
    }
}

/// Drops a staging table on drop unless disarmed.
///
/// Covers exits that skip the orchestrator's cleanup step, such as a
/// cancelled future. The drop runs on a spawned task; its failure is logged
/// and the table is left to expire.
pub struct StagingGuard {
    warehouse: Option<Arc<dyn Warehouse>>,
    pipeline: String,
    table: String,
}

impl StagingGuard {
    pub fn disarm(mut self) {
        self.warehouse = None;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        let Some(warehouse) = self.warehouse.take() else {
            return;
        };
        let pipeline = std::mem::take(&mut self.pipeline);
        let table = std::mem::take(&mut self.table);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(target = %pipeline, staging = %table, "No runtime to drop staging table; left to expire");
            return;
        };
        handle.spawn(async move {
            if let Err(e) = dispose_table(warehouse.as_ref(), &pipeline, &table).await {
                emit!(StagingCleanupFailed {
                    pipeline: pipeline.clone(),
                });
                warn!(target = %pipeline, staging = %table, error = %e, "Staging cleanup failed; left to expire");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryWarehouse;
    use crate::schema::{ColumnDef, ColumnType};
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema::new(vec![
            ColumnDef {
                name: "ID".into(),
                column_type: ColumnType::String,
                nullable: false,
            },
            ColumnDef {
                name: "AMOUNT".into(),
                column_type: ColumnType::Numeric,
                nullable: true,
            },
        ])
    }

    fn record(id: &str, amount: &str) -> Record {
        let mut record = Record::new();
        record.insert("ID".into(), json!(id));
        record.insert("AMOUNT".into(), json!(amount));
        record
    }

    #[test]
    fn test_staging_name_shape() {
        let name = staging_table_name("ORDERS");
        assert!(name.starts_with("ORDERS__staging_"));
        assert_eq!(name.len(), "ORDERS__staging_".len() + 8);
        assert_ne!(name, staging_table_name("ORDERS"));
    }

    #[tokio::test]
    async fn test_create_append_dispose() {
        let warehouse = MemoryWarehouse::new();
        let loader = StagingLoader::new(Arc::new(warehouse.clone()), "orders", DEFAULT_STAGING_EXPIRATION);
        let now = Utc::now();

        let mut table = loader.create("ORDERS", &schema(), now).await.unwrap();
        assert!(warehouse.has_table(&table.name));
        let options = warehouse.table_options(&table.name).unwrap();
        assert_eq!(options.expires_at, Some(now + chrono::Duration::hours(2)));

        loader
            .append(&mut table, &[record("A", "1.5"), record("B", "2")])
            .await
            .unwrap();
        loader.append(&mut table, &[]).await.unwrap();
        loader.append(&mut table, &[record("C", "3")]).await.unwrap();
        assert_eq!((table.batches, table.rows), (2, 3));
        assert_eq!(warehouse.rows(&table.name).len(), 3);

        loader.dispose(&table).await.unwrap();
        assert!(!warehouse.has_table(&table.name));
        // Already gone.
        loader.dispose(&table).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_drops_expired_tables() {
        let warehouse = MemoryWarehouse::new();
        let loader = StagingLoader::new(Arc::new(warehouse.clone()), "orders", Duration::from_secs(60));
        let start = Utc::now();

        let abandoned = loader.create("ORDERS", &schema(), start).await.unwrap();
        let later = start + chrono::Duration::minutes(5);
        let fresh = loader.create("ORDERS", &schema(), later).await.unwrap();

        assert!(!warehouse.has_table(&abandoned.name));
        assert!(warehouse.has_table(&fresh.name));
    }

    #[tokio::test]
    async fn test_failed_append_reports_batch() {
        let warehouse = MemoryWarehouse::new();
        warehouse.fail_insert_at(2);
        let loader = StagingLoader::new(Arc::new(warehouse.clone()), "orders", DEFAULT_STAGING_EXPIRATION);

        let mut table = loader.create("ORDERS", &schema(), Utc::now()).await.unwrap();
        loader.append(&mut table, &[record("A", "1")]).await.unwrap();
        let err = loader.append(&mut table, &[record("B", "2")]).await.unwrap_err();
        assert!(matches!(err, StagingError::Append { batch: 2, .. }));
        assert_eq!(table.batches, 1);
    }

    #[tokio::test]
    async fn test_guard_drops_table_unless_disarmed() {
        let warehouse = MemoryWarehouse::new();
        let loader = StagingLoader::new(Arc::new(warehouse.clone()), "orders", DEFAULT_STAGING_EXPIRATION);

        let kept = loader.create("ORDERS", &schema(), Utc::now()).await.unwrap();
        loader.guard(&kept).disarm();

        let abandoned = loader.create("ORDERS", &schema(), Utc::now()).await.unwrap();
        drop(loader.guard(&abandoned));

        for _ in 0..50 {
            if !warehouse.has_table(&abandoned.name) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!warehouse.has_table(&abandoned.name));
        assert!(warehouse.has_table(&kept.name));
    }
}
