//! Turning configuration into running pipelines.
//!
//! Every table with a `schedule_interval_secs` gets its own polling loop. When
//! a `trigger` section is present, one more pipeline serves the HTTP trigger
//! surface for every configured table. All of them share one source pool, one
//! warehouse handle and one sync record store.

mod processor;

use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tracing::{info, warn};

use ferry_core::polling::run_polling_loop;
use ferry_core::{AppConfig, ConfigPath, Pipeline, PipelineContext, random_jitter};

use crate::backend::{MemoryLedger, MemorySource, MemoryWarehouse, SqliteSourceConnector, SqliteWarehouse};
use crate::config::{
    Config, CredentialsConfig, SecretStoreKind, SourceKind, TableKey, WarehouseConfig, WarehouseKind,
};
use crate::credentials::{CredentialProvider, EnvSecretStore, FileSecretStore, SecretStore};
use crate::error::{ConfigError, OpenWarehouseSnafu, PipelineError};
use crate::ledger::SyncRecordStore;
use crate::orchestrator::SyncOrchestrator;
use crate::pool::SourcePool;
use crate::source::SourceConnector;
use crate::trigger::{self, TriggerState};
use crate::warehouse::Warehouse;

use processor::TableProcessor;

/// Shared handles every orchestrator of a process uses.
#[derive(Clone)]
pub struct Backends {
    pub pool: SourcePool,
    pub warehouse: Arc<dyn Warehouse>,
    pub ledger: Arc<dyn SyncRecordStore>,
}

impl Backends {
    /// Open the configured source connector, credentials, warehouse and ledger.
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let source = config.source.clone().unwrap_or_default();
        let connector: Arc<dyn SourceConnector> = match source.kind {
            SourceKind::Sqlite => Arc::new(SqliteSourceConnector),
            SourceKind::Memory => Arc::new(MemorySource::new()),
        };
        let credentials = Arc::new(credential_provider(&config.credentials()));
        let pool = SourcePool::new(connector, credentials, source.pool_options());

        let (warehouse, ledger) = open_warehouse(config.warehouse.as_ref())?;
        Ok(Self {
            pool,
            warehouse,
            ledger,
        })
    }

    pub fn orchestrator(&self, config: &Config, key: &TableKey) -> Option<SyncOrchestrator> {
        let table = config.table(key.id())?;
        Some(SyncOrchestrator::new(
            key.clone(),
            table.clone(),
            self.pool.clone(),
            self.warehouse.clone(),
            self.ledger.clone(),
            config.ledger().lease_timeout(),
        ))
    }
}

fn credential_provider(config: &CredentialsConfig) -> CredentialProvider {
    let store: Arc<dyn SecretStore> = match (&config.store, &config.dir) {
        (SecretStoreKind::File, Some(dir)) => Arc::new(FileSecretStore::new(dir.clone())),
        _ => Arc::new(EnvSecretStore::new(config.prefix.clone())),
    };
    let provider = config
        .required
        .iter()
        .fold(CredentialProvider::new(store, config.cache_ttl()), |p, (param, secret)| {
            p.require(param.clone(), secret.clone())
        });
    config
        .optional
        .iter()
        .fold(provider, |p, (param, secret)| p.optional(param.clone(), secret.clone()))
}

/// Open the configured warehouse together with the sync record store it hosts.
///
/// A SQLite warehouse serves both roles from one file. The in-memory backend
/// is used when no warehouse is configured.
pub fn open_warehouse(
    config: Option<&WarehouseConfig>,
) -> Result<(Arc<dyn Warehouse>, Arc<dyn SyncRecordStore>), PipelineError> {
    match config {
        Some(WarehouseConfig {
            kind: WarehouseKind::Sqlite,
            path: Some(path),
        }) => {
            let warehouse = SqliteWarehouse::open(path).context(OpenWarehouseSnafu)?;
            info!(path = %path, "Opened SQLite warehouse");
            Ok((Arc::new(warehouse.clone()), Arc::new(warehouse)))
        }
        Some(WarehouseConfig {
            kind: WarehouseKind::Sqlite,
            path: None,
        }) => Err(PipelineError::Config {
            source: ConfigError::MissingSection {
                section: "warehouse.path".into(),
            },
        }),
        Some(WarehouseConfig {
            kind: WarehouseKind::Memory,
            ..
        })
        | None => {
            warn!("Using the in-memory warehouse; nothing survives a restart");
            Ok((Arc::new(MemoryWarehouse::new()), Arc::new(MemoryLedger::new())))
        }
    }
}

enum Task {
    /// Scheduled runs of one table.
    Scheduled {
        orchestrator: SyncOrchestrator,
        interval: Duration,
    },
    /// The HTTP trigger server for every table.
    Trigger { address: String, state: TriggerState },
}

/// One unit run by the core pipeline runner.
pub struct FerryPipeline {
    key: TableKey,
    task: Task,
    context: PipelineContext,
}

impl FerryPipeline {
    /// Build the scheduled table pipelines and the trigger pipeline.
    pub fn from_config(config: &Config, context: PipelineContext) -> Result<Vec<Self>, PipelineError> {
        if config.tables.is_empty() {
            warn!("No tables configured");
            return Ok(Vec::new());
        }

        let backends = Backends::from_config(config)?;
        let orchestrators: Vec<SyncOrchestrator> = config
            .tables
            .keys()
            .filter_map(|key| backends.orchestrator(config, key))
            .collect();

        let mut pipelines: Vec<Self> = orchestrators
            .iter()
            .filter_map(|orchestrator| {
                let interval = orchestrator.table().schedule_interval_secs?;
                Some(Self {
                    key: orchestrator.key().clone(),
                    task: Task::Scheduled {
                        orchestrator: orchestrator.clone(),
                        interval: Duration::from_secs(interval),
                    },
                    context: context.clone(),
                })
            })
            .collect();

        if let Some(trigger) = &config.trigger {
            pipelines.push(Self {
                key: TableKey::new("trigger"),
                task: Task::Trigger {
                    address: trigger.address.clone(),
                    state: TriggerState::new(orchestrators).with_context(context.clone()),
                },
                context,
            });
        }

        if pipelines.is_empty() {
            warn!("No table has schedule_interval_secs and no trigger is configured; nothing to run");
        }
        Ok(pipelines)
    }

    async fn execute(self) -> Result<(), PipelineError> {
        match self.task {
            Task::Scheduled {
                orchestrator,
                interval,
            } => {
                let effective_interval = interval + random_jitter(self.context.poll_jitter_secs);
                info!(
                    target = %self.key,
                    interval_secs = effective_interval.as_secs(),
                    "Scheduled sync initialized"
                );
                let mut processor = TableProcessor::new(orchestrator, self.context.clone());
                run_polling_loop(
                    &mut processor,
                    effective_interval,
                    self.context.poll_jitter_secs,
                    self.context.shutdown,
                    self.key.id(),
                    "ferry",
                )
                .await
            }
            Task::Trigger { address, state } => {
                trigger::serve(&address, state, self.context.shutdown).await
            }
        }
    }
}

impl Pipeline for FerryPipeline {
    type Key = TableKey;
    type Error = PipelineError;

    fn key(&self) -> &Self::Key {
        &self.key
    }

    async fn run(self) -> Result<(), Self::Error> {
        self.execute().await
    }
}

impl AppConfig for Config {
    type Pipeline = FerryPipeline;
    type BuildError = PipelineError;

    const COMPONENT_NAME: &'static str = "table";

    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        Config::load(paths)
    }

    fn create_pipelines(&self, context: PipelineContext) -> Result<Vec<FerryPipeline>, PipelineError> {
        FerryPipeline::from_config(self, context)
    }

    fn log_startup_info(&self) {
        info!("Starting ferry with {} table(s)", self.table_count());
        for (key, table) in &self.tables {
            info!(
                "  Table: {} ({} -> {}, {} {}, every {})",
                key,
                table.source_table,
                table.target_table,
                table.sync_type.as_str(),
                table.reconcile,
                table
                    .schedule_interval_secs
                    .map_or_else(|| "trigger only".to_string(), |s| format!("{s}s"))
            );
        }
        if let Some(trigger) = &self.trigger {
            info!("  Trigger: {}", trigger.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn context() -> PipelineContext {
        PipelineContext::new(None, 0, CancellationToken::new())
    }

    #[test]
    fn test_pipelines_from_config() {
        let config = Config::parse(
            r#"
source: { kind: memory }
warehouse: { kind: memory }
trigger: { address: "127.0.0.1:18080" }
tables:
  scheduled:
    source_table: { name: A }
    target_table: A_BQ
    key_columns: [ID]
    schedule_interval_secs: 3600
  on_demand:
    source_table: { name: B }
    target_table: B_BQ
    key_columns: [ID]
"#,
        )
        .unwrap();

        let pipelines = FerryPipeline::from_config(&config, context()).unwrap();
        let keys: Vec<_> = pipelines.iter().map(|p| p.key().to_string()).collect();
        assert_eq!(keys, vec!["scheduled", "trigger"]);
        match &pipelines[1].task {
            Task::Trigger { state, .. } => assert_eq!(state.table_count(), 2),
            Task::Scheduled { .. } => panic!("expected trigger"),
        }
    }

    #[test]
    fn test_sqlite_warehouse_opens_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warehouse.db");
        let config = WarehouseConfig {
            kind: WarehouseKind::Sqlite,
            path: Some(path.to_string_lossy().into_owned()),
        };
        let (warehouse, _) = open_warehouse(Some(&config)).unwrap();
        assert_eq!(warehouse.name(), "sqlite");
        assert!(path.exists());
    }

    #[test]
    fn test_missing_warehouse_path() {
        let config = WarehouseConfig {
            kind: WarehouseKind::Sqlite,
            path: None,
        };
        assert!(matches!(
            open_warehouse(Some(&config)),
            Err(PipelineError::Config { .. })
        ));
    }
}
