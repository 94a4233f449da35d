//! Configuration for the freshness monitor.
//!
//! The monitor reads the same warehouse the sync engine writes and shares its
//! ledger settings, so a lease held by a running sync is visible here.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use ferry::config::{LedgerConfig, TableKey, WarehouseConfig, WarehouseKind};
use ferry_core::config::{
    ConfigPath, GlobalConfig, LoggingConfig, Mergeable, MetricsConfig, load_from_paths,
    merge_singleton, parse_str,
};
use ferry_core::ConfigError;

/// Poll cadence, trigger timeout and alert destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Timeout of a fallback trigger request. The sync itself may take longer.
    #[serde(default = "default_trigger_timeout_secs")]
    pub trigger_timeout_secs: u64,
    /// Alerts are POSTed here as JSON. Absent means alerts are only logged.
    #[serde(default)]
    pub alert_webhook: Option<String>,
}

fn default_poll_interval_secs() -> u64 {
    4 * 3600
}

fn default_trigger_timeout_secs() -> u64 {
    30
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            trigger_timeout_secs: default_trigger_timeout_secs(),
            alert_webhook: None,
        }
    }
}

impl MonitorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.trigger_timeout_secs)
    }
}

/// Where a fallback sync is requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FallbackConfig {
    /// Usually the engine's `POST /sync/{table}?wait=false`.
    pub url: String,
}

/// Expectations on a pipeline's sync history in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OrchestrationConfig {
    /// A sync is expected to complete at least this often.
    pub expected_interval_hours: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

fn default_max_consecutive_failures() -> u32 {
    3
}

impl OrchestrationConfig {
    pub fn new(expected_interval_hours: u64) -> Self {
        Self {
            expected_interval_hours,
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }

    pub fn expected_interval(&self) -> chrono::Duration {
        chrono::Duration::hours(i64::try_from(self.expected_interval_hours).unwrap_or(i64::MAX / 3600))
    }
}

/// One monitored target table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MonitoredTable {
    pub target_table: String,
    /// Date or timestamp column whose maximum marks the last write.
    pub freshness_column: String,
    #[serde(default = "default_warning_threshold_days")]
    pub warning_threshold_days: u32,
    #[serde(default = "default_critical_threshold_days")]
    pub critical_threshold_days: u32,
    #[serde(default = "default_min_row_count")]
    pub min_row_count: u64,
    /// Without a fallback, a critical table is only alerted on.
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
    /// Ledger pipeline name to check for an in-flight sync. Defaults to the table key.
    #[serde(default)]
    pub pipeline: Option<String>,
    /// Columns that identify a row. Empty skips the duplicate check.
    #[serde(default)]
    pub key_columns: Vec<String>,
    /// Duplicate rows tolerated, as a percentage of the row count.
    #[serde(default)]
    pub duplicate_threshold_percent: f64,
    /// Absent skips the sync history check.
    #[serde(default)]
    pub orchestration: Option<OrchestrationConfig>,
}

fn default_warning_threshold_days() -> u32 {
    1
}

fn default_critical_threshold_days() -> u32 {
    3
}

fn default_min_row_count() -> u64 {
    1
}

impl MonitoredTable {
    pub fn new(target_table: impl Into<String>, freshness_column: impl Into<String>) -> Self {
        Self {
            target_table: target_table.into(),
            freshness_column: freshness_column.into(),
            warning_threshold_days: default_warning_threshold_days(),
            critical_threshold_days: default_critical_threshold_days(),
            min_row_count: default_min_row_count(),
            fallback: None,
            pipeline: None,
            key_columns: Vec::new(),
            duplicate_threshold_percent: 0.0,
            orchestration: None,
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.target_table.trim().is_empty() {
            return Err("empty target_table".into());
        }
        if self.freshness_column.trim().is_empty() {
            return Err("empty freshness_column".into());
        }
        if self.warning_threshold_days > self.critical_threshold_days {
            return Err(format!(
                "warning_threshold_days ({}) exceeds critical_threshold_days ({})",
                self.warning_threshold_days, self.critical_threshold_days
            ));
        }
        if let Some(fallback) = &self.fallback
            && !is_http_url(&fallback.url)
        {
            return Err(format!("fallback url '{}' is not http(s)", fallback.url));
        }
        if self.key_columns.iter().any(|c| c.trim().is_empty()) {
            return Err("empty name in key_columns".into());
        }
        if !(0.0..=100.0).contains(&self.duplicate_threshold_percent) {
            return Err("duplicate_threshold_percent must be between 0 and 100".into());
        }
        if let Some(orchestration) = &self.orchestration {
            if orchestration.expected_interval_hours == 0 {
                return Err("orchestration.expected_interval_hours must be greater than zero".into());
            }
            if orchestration.max_consecutive_failures == 0 {
                return Err("orchestration.max_consecutive_failures must be greater than zero".into());
            }
        }
        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,
    #[serde(default)]
    pub monitor: Option<MonitorSettings>,
    #[serde(default)]
    pub ledger: Option<LedgerConfig>,
    #[serde(default)]
    pub tables: IndexMap<TableKey, MonitoredTable>,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Mergeable for Config {
    type Key = TableKey;
    type Component = MonitoredTable;

    fn components(&self) -> &IndexMap<TableKey, MonitoredTable> {
        &self.tables
    }

    fn components_mut(&mut self) -> &mut IndexMap<TableKey, MonitoredTable> {
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
        merge_singleton(&mut self.warehouse, &mut other.warehouse, "warehouse")?;
        merge_singleton(&mut self.monitor, &mut other.monitor, "monitor")?;
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

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the merged configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !self.tables.is_empty() && self.warehouse.is_none() {
            errors.push(ConfigError::MissingSection {
                section: "warehouse".into(),
            });
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
        if let Some(url) = self.monitor.as_ref().and_then(|m| m.alert_webhook.as_deref())
            && !is_http_url(url)
        {
            errors.push(ConfigError::InvalidComponent {
                component: "monitor".into(),
                key: "alert_webhook".into(),
                message: format!("'{url}' is not http(s)"),
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

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleErrors {
                errors: errors.iter().map(ToString::to_string).collect(),
            }),
        }
    }

    pub fn settings(&self) -> MonitorSettings {
        self.monitor.clone().unwrap_or_default()
    }

    pub fn ledger(&self) -> LedgerConfig {
        self.ledger.clone().unwrap_or_default()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }
}

fn invalid_table(key: &TableKey, message: &str) -> ConfigError {
    ConfigError::InvalidComponent {
        component: "table".into(),
        key: key.id().to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
warehouse: { kind: sqlite, path: /tmp/warehouse.db }
monitor:
  poll_interval_secs: 600
  alert_webhook: "https://hooks.example/ferry"
tables:
  work_items:
    target_table: WORK_ITEMS_BQ
    freshness_column: REPORTING_DATE
    fallback: { url: "http://ferry:8080/sync/work_items?wait=false" }
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::parse(BASIC).unwrap();
        let table = &config.tables["work_items"];

        assert_eq!(table.warning_threshold_days, 1);
        assert_eq!(table.critical_threshold_days, 3);
        assert_eq!(table.min_row_count, 1);
        assert_eq!(config.settings().poll_interval(), Duration::from_secs(600));
        assert_eq!(config.settings().trigger_timeout(), Duration::from_secs(30));
        assert_eq!(config.ledger().lease_timeout_secs, 7200);
    }

    #[test]
    fn test_quality_checks_parse() {
        let config = Config::parse(
            r#"
warehouse: { kind: memory }
tables:
  orders:
    target_table: ORDERS
    freshness_column: DAY
    key_columns: [ID]
    duplicate_threshold_percent: 2.5
    orchestration: { expected_interval_hours: 24 }
"#,
        )
        .unwrap();
        let table = &config.tables["orders"];
        assert_eq!(table.key_columns, vec!["ID".to_string()]);
        assert_eq!(table.duplicate_threshold_percent, 2.5);
        let orchestration = table.orchestration.as_ref().unwrap();
        assert_eq!(orchestration.max_consecutive_failures, 3);
        assert_eq!(orchestration.expected_interval(), chrono::Duration::hours(24));

        let err = Config::parse(
            r#"
warehouse: { kind: memory }
tables:
  orders:
    target_table: ORDERS
    freshness_column: DAY
    orchestration: { expected_interval_hours: 0 }
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("expected_interval_hours"));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let err = Config::parse(
            r#"
warehouse: { kind: memory }
tables:
  orders:
    target_table: ORDERS
    freshness_column: DAY
    warning_threshold_days: 5
    critical_threshold_days: 2
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("exceeds critical_threshold_days"));
    }

    #[test]
    fn test_errors_are_accumulated() {
        let err = Config::parse(
            r#"
monitor: { alert_webhook: "ftp://nope" }
tables:
  orders:
    target_table: ORDERS
    freshness_column: ""
"#,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Multiple config errors"));
        assert!(message.contains("warehouse"));
        assert!(message.contains("alert_webhook"));
        assert!(message.contains("freshness_column"));
    }

    #[test]
    fn test_split_files_merge() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.yaml"), "warehouse: { kind: memory }\n").unwrap();
        std::fs::write(
            dir.path().join("tables.yaml"),
            "tables:\n  orders: { target_table: ORDERS, freshness_column: DAY }\n",
        )
        .unwrap();

        let config = Config::load(&[ConfigPath::dir(dir.path())]).unwrap();
        assert_eq!(config.table_count(), 1);
    }
}
