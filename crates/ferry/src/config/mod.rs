//! Configuration for the ferry sync engine.
//!
//! One YAML document (or several, merged) describes the source connection,
//! credential lookup, destination warehouse, optional trigger server and a
//! declarative descriptor per synced table.

mod table_key;

use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use ferry_core::config::{
    ConfigPath, GlobalConfig, LoggingConfig, Mergeable, MetricsConfig, Resource, load_from_paths,
    merge_singleton, parse_str,
};
pub use ferry_core::RetryConfig;
pub use table_key::TableKey;

use crate::credentials::DEFAULT_CACHE_TTL;
use crate::error::ConfigError;
use crate::ledger::Chunking;
use crate::normalize::NullPartitionPolicy;
use crate::pool::PoolOptions;
use crate::reconcile::ReconcileMode;
use crate::source::SourceTableRef;
use crate::validate::DEFAULT_VALIDATION_THRESHOLD_PERCENT;

// ============ Source ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Sqlite,
    /// In-process source, empty at startup. For smoke tests.
    Memory,
}

/// Source warehouse connection and pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_true")]
    pub validate_on_checkout: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            max_connections: default_max_connections(),
            validate_on_checkout: true,
            retry: RetryConfig::default(),
        }
    }
}

impl SourceConfig {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_connections: self.max_connections,
            validate_on_checkout: self.validate_on_checkout,
            retry: self.retry.policy(),
            label: "source".to_string(),
        }
    }
}

fn default_max_connections() -> usize {
    3
}

fn default_true() -> bool {
    true
}

// ============ Credentials ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStoreKind {
    #[default]
    Env,
    File,
}

/// Where connection secrets come from and which parameters they fill.
///
/// `required` and `optional` map connection parameter names to secret names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub store: SecretStoreKind,
    /// Prefix prepended to secret names (env store).
    #[serde(default)]
    pub prefix: String,
    /// Directory holding one file per secret (file store).
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub required: IndexMap<String, String>,
    #[serde(default)]
    pub optional: IndexMap<String, String>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            store: SecretStoreKind::default(),
            prefix: String::new(),
            dir: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            required: IndexMap::new(),
            optional: IndexMap::new(),
        }
    }
}

impl CredentialsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_cache_ttl_secs() -> u64 {
    DEFAULT_CACHE_TTL.as_secs()
}

// ============ Warehouse ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarehouseKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub kind: WarehouseKind,
    /// Database file (sqlite).
    #[serde(default)]
    pub path: Option<String>,
}

impl WarehouseConfig {
    pub fn resources(&self) -> Vec<Resource> {
        match (&self.kind, &self.path) {
            (WarehouseKind::Sqlite, Some(path)) => vec![Resource::file(path)],
            _ => Vec::new(),
        }
    }
}

// ============ Trigger and ledger ============

/// HTTP trigger surface. Absent means scheduled runs only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    #[serde(default = "default_trigger_address")]
    pub address: String,
}

fn default_trigger_address() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// A PROCESSING record older than this no longer blocks new syncs.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: default_lease_timeout_secs(),
        }
    }
}

impl LedgerConfig {
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

fn default_lease_timeout_secs() -> u64 {
    7200
}

// ============ Tables ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    #[default]
    Full,
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaginationKind {
    #[default]
    Offset,
    Cursor,
    Range,
}

impl PaginationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaginationKind::Offset => "offset",
            PaginationKind::Cursor => "cursor",
            PaginationKind::Range => "range",
        }
    }
}

/// Declarative descriptor of one synced table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub source_table: SourceTableRef,
    pub target_table: String,
    #[serde(default)]
    pub key_columns: Vec<String>,
    /// Deterministic extraction order. Defaults to the key columns.
    #[serde(default)]
    pub order_by: Vec<String>,
    #[serde(default)]
    pub sync_type: SyncType,
    #[serde(default)]
    pub reconcile: ReconcileMode,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub pagination: PaginationKind,
    #[serde(default)]
    pub cursor_column: Option<String>,
    #[serde(default = "default_window_days")]
    pub window_days: u32,
    /// Change-date column for incremental windows.
    #[serde(default)]
    pub incremental_column: Option<String>,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Date column the target is partitioned by; also scopes explicit ranges.
    #[serde(default)]
    pub partition_column: Option<String>,
    #[serde(default, with = "serde_yaml::with::singleton_map")]
    pub null_partition: NullPartitionPolicy,
    #[serde(default)]
    pub cluster_columns: Vec<String>,
    #[serde(default)]
    pub stale_cleanup: bool,
    /// Count the source window before trusting an empty extraction.
    #[serde(default = "default_true")]
    pub verify_empty_source: bool,
    #[serde(default)]
    pub chunking: Option<Chunking>,
    #[serde(default = "default_staging_expiration_hours")]
    pub staging_expiration_hours: u64,
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
    /// Run on this interval. Without it the table only syncs when triggered.
    #[serde(default)]
    pub schedule_interval_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub validate: bool,
    #[serde(default = "default_validation_threshold_percent")]
    pub validation_threshold_percent: f64,
    #[serde(default)]
    pub deduplicate: bool,
}

fn default_batch_size() -> usize {
    5000
}

fn default_window_days() -> u32 {
    1
}

fn default_lookback_days() -> u32 {
    7
}

fn default_staging_expiration_hours() -> u64 {
    2
}

fn default_validation_threshold_percent() -> f64 {
    DEFAULT_VALIDATION_THRESHOLD_PERCENT
}

impl TableConfig {
    /// A table with every optional setting at its default.
    pub fn new(source_table: SourceTableRef, target_table: impl Into<String>) -> Self {
        Self {
            source_table,
            target_table: target_table.into(),
            key_columns: Vec::new(),
            order_by: Vec::new(),
            sync_type: SyncType::default(),
            reconcile: ReconcileMode::default(),
            batch_size: default_batch_size(),
            pagination: PaginationKind::default(),
            cursor_column: None,
            window_days: default_window_days(),
            incremental_column: None,
            lookback_days: default_lookback_days(),
            partition_column: None,
            null_partition: NullPartitionPolicy::default(),
            cluster_columns: Vec::new(),
            stale_cleanup: false,
            verify_empty_source: true,
            chunking: None,
            staging_expiration_hours: default_staging_expiration_hours(),
            time_budget_secs: None,
            schedule_interval_secs: None,
            validate: true,
            validation_threshold_percent: default_validation_threshold_percent(),
            deduplicate: false,
        }
    }

    /// Extraction ordering: `order_by`, else the key columns.
    pub fn effective_order_by(&self) -> &[String] {
        if self.order_by.is_empty() {
            &self.key_columns
        } else {
            &self.order_by
        }
    }

    /// Column that date windows filter on.
    pub fn window_column(&self) -> Option<&str> {
        self.partition_column
            .as_deref()
            .or(self.incremental_column.as_deref())
    }

    pub fn staging_expiration(&self) -> Duration {
        Duration::from_secs(self.staging_expiration_hours * 3600)
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs.map(Duration::from_secs)
    }

    pub fn resources(&self) -> Vec<Resource> {
        vec![Resource::table(&self.target_table)]
    }

    /// Check the descriptor for combinations that cannot run.
    pub fn validate(&self) -> Result<(), String> {
        if self.source_table.name.trim().is_empty() {
            return Err("empty source_table name".into());
        }
        if self.target_table.trim().is_empty() {
            return Err("empty target_table".into());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be greater than zero".into());
        }
        if self.reconcile == ReconcileMode::Merge && self.key_columns.is_empty() {
            return Err("merge reconcile requires key_columns".into());
        }
        if self.sync_type == SyncType::Incremental {
            if self.reconcile == ReconcileMode::Replace {
                return Err("incremental sync requires merge reconcile".into());
            }
            if self.window_column().is_none() {
                return Err("incremental sync requires incremental_column or partition_column".into());
            }
        }
        if self.stale_cleanup {
            if self.reconcile == ReconcileMode::Replace {
                return Err("stale_cleanup is not allowed with replace reconcile".into());
            }
            if self.window_column().is_none() {
                return Err("stale_cleanup requires partition_column or incremental_column".into());
            }
        }
        // An unbounded full sync of a range-paginated table pages by offset.
        if matches!(self.pagination, PaginationKind::Offset | PaginationKind::Range)
            && self.effective_order_by().is_empty()
        {
            return Err(format!(
                "{} pagination requires order_by or key_columns",
                self.pagination.as_str()
            ));
        }
        match self.pagination {
            PaginationKind::Offset => {}
            PaginationKind::Cursor => {
                if self.cursor_column.as_deref().is_none_or(|c| c.trim().is_empty()) {
                    return Err("cursor pagination requires cursor_column".into());
                }
            }
            PaginationKind::Range => {
                if self.window_column().is_none() {
                    return Err("range pagination requires partition_column or incremental_column".into());
                }
                if self.window_days == 0 {
                    return Err("window_days must be greater than zero".into());
                }
            }
        }
        if let Some(chunking) = &self.chunking {
            if chunking.chunk_days == 0 {
                return Err("chunking.chunk_days must be greater than zero".into());
            }
            if self.window_column().is_none() {
                return Err("chunking requires partition_column or incremental_column".into());
            }
        }
        if !(0.0..=100.0).contains(&self.validation_threshold_percent) {
            return Err("validation_threshold_percent must be between 0 and 100".into());
        }
        Ok(())
    }
}

// ============ Root ============

/// Root configuration of the `ferry` binary.
///
/// ```yaml
/// source:
///   kind: sqlite
/// credentials:
///   required: { path: SOURCE_DATABASE_PATH }
/// warehouse:
///   kind: sqlite
///   path: /var/lib/ferry/warehouse.db
/// trigger:
///   address: 0.0.0.0:8080
/// tables:
///   work_items:
///     source_table: { name: WORK_ITEMS }
///     target_table: WORK_ITEMS_BQ
///     key_columns: [WORK_ITEM_ID]
///     schedule_interval_secs: 86400
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub source: Option<SourceConfig>,
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,
    #[serde(default)]
    pub trigger: Option<TriggerConfig>,
    #[serde(default)]
    pub ledger: Option<LedgerConfig>,
    #[serde(default)]
    pub tables: IndexMap<TableKey, TableConfig>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Mergeable for Config {
    type Key = TableKey;
    type Component = TableConfig;

    fn components(&self) -> &IndexMap<TableKey, TableConfig> {
        &self.tables
    }

    fn components_mut(&mut self) -> &mut IndexMap<TableKey, TableConfig> {
        &mut self.tables
    }

    fn global(&self) -> &GlobalConfig {
        &self.global
    }

    fn global_mut(&mut self) -> &mut GlobalConfig {
        &mut self.global
    }

    fn metrics(&self) -> &MetricsConfig {
        &self.metrics
    }

    fn metrics_mut(&mut self) -> &mut MetricsConfig {
        &mut self.metrics
    }

    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn logging_mut(&mut self) -> &mut LoggingConfig {
        &mut self.logging
    }

    fn parse_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|source| ConfigError::YamlParse { source })
    }

    fn merge_sections(&mut self, other: &mut Self) -> Result<(), ConfigError> {
        merge_singleton(&mut self.source, &mut other.source, "source")?;
        merge_singleton(&mut self.credentials, &mut other.credentials, "credentials")?;
        merge_singleton(&mut self.warehouse, &mut other.warehouse, "warehouse")?;
        merge_singleton(&mut self.trigger, &mut other.trigger, "trigger")?;
        merge_singleton(&mut self.ledger, &mut other.ledger, "ledger")
    }
}

impl Config {
    /// Load, merge and validate configuration from files and directories.
    pub fn load(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        let config: Self = load_from_paths(paths)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a single YAML document.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the merged configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !self.tables.is_empty() {
            if self.source.is_none() {
                errors.push(ConfigError::MissingSection {
                    section: "source".into(),
                });
            }
            if self.warehouse.is_none() {
                errors.push(ConfigError::MissingSection {
                    section: "warehouse".into(),
                });
            }
        }

        if let Some(warehouse) = &self.warehouse
            && warehouse.kind == WarehouseKind::Sqlite
            && warehouse.path.as_deref().is_none_or(|p| p.trim().is_empty())
        {
            errors.push(ConfigError::InvalidComponent {
                component: "warehouse".into(),
                key: "sqlite".into(),
                message: "path is required".into(),
            });
        }

        if let Some(credentials) = &self.credentials
            && credentials.store == SecretStoreKind::File
            && credentials.dir.is_none()
        {
            errors.push(ConfigError::InvalidComponent {
                component: "credentials".into(),
                key: "file".into(),
                message: "dir is required".into(),
            });
        }

        for (key, table) in &self.tables {
            if let Err(message) = key.validate() {
                errors.push(invalid_table(key, &message));
            }
            if let Err(message) = table.validate() {
                errors.push(invalid_table(key, &message));
            }
        }

        let mut claims: Vec<(String, Vec<Resource>)> = self
            .tables
            .iter()
            .map(|(key, table)| (key.id().to_string(), table.resources()))
            .collect();
        if let Some(trigger) = &self.trigger
            && let Some(port) = trigger
                .address
                .rsplit_once(':')
                .and_then(|(_, port)| port.parse::<u16>().ok())
        {
            claims.push(("trigger".into(), vec![Resource::port(port)]));
        }
        if let Some(port) = self
            .metrics
            .address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
        {
            claims.push(("metrics".into(), vec![Resource::port(port)]));
        }

        let conflicts = Resource::conflicts(claims);
        if !conflicts.is_empty() {
            errors.push(ConfigError::ResourceConflict {
                message: Resource::describe_conflicts(&conflicts),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleErrors {
                errors: errors.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    pub fn table(&self, key: &str) -> Option<&TableConfig> {
        self.tables.get(key)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn ledger(&self) -> LedgerConfig {
        self.ledger.clone().unwrap_or_default()
    }

    pub fn credentials(&self) -> CredentialsConfig {
        self.credentials.clone().unwrap_or_default()
    }
}

fn invalid_table(key: &TableKey, message: &str) -> ConfigError {
    ConfigError::InvalidComponent {
        component: "table".into(),
        key: key.id().to_string(),
        message: message.to_string(),
    }
}
