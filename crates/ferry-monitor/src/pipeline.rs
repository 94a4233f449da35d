//! The monitor as a single polling pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::ResultExt;
use tracing::{info, warn};

use ferry::config::TableKey;
use ferry::open_warehouse;
use ferry_core::polling::{IterationResult, PollingProcessor, run_polling_loop};
use ferry_core::{AppConfig, ConfigPath, Pipeline, PipelineContext, random_jitter};

use crate::alert::{AlertSink, LogAlertSink, WebhookAlertSink};
use crate::config::Config;
use crate::error::{ConfigError, HttpClientSnafu, MonitorError, OpenWarehouseSnafu};
use crate::fallback::FallbackClient;
use crate::monitor::HealthMonitor;

/// Runs one monitoring pass per poll. A pass never fails; problems end up in
/// its report and alerts.
struct MonitorProcessor {
    monitor: HealthMonitor,
}

#[async_trait]
impl PollingProcessor for MonitorProcessor {
    type State = ();
    type Error = MonitorError;

    async fn prepare(&mut self, _cold_start: bool) -> Result<Option<Self::State>, Self::Error> {
        Ok(Some(()))
    }

    async fn process(&mut self, _state: Self::State) -> Result<IterationResult, Self::Error> {
        let report = self.monitor.check().await;
        if report.tables_checked == 0 {
            Ok(IterationResult::NoItems)
        } else {
            Ok(IterationResult::ProcessedItems)
        }
    }
}

pub struct MonitorPipeline {
    key: TableKey,
    monitor: HealthMonitor,
    interval: Duration,
    context: PipelineContext,
}

impl MonitorPipeline {
    pub fn from_config(config: &Config, context: PipelineContext) -> Result<Self, MonitorError> {
        let settings = config.settings();
        let client = reqwest::Client::builder()
            .build()
            .context(HttpClientSnafu)?;

        let sink: Arc<dyn AlertSink> = match &settings.alert_webhook {
            Some(url) => Arc::new(WebhookAlertSink::new(client.clone(), url.clone())),
            None => Arc::new(LogAlertSink),
        };
        let (warehouse, ledger) =
            open_warehouse(config.warehouse.as_ref()).context(OpenWarehouseSnafu)?;

        let monitor = config.tables.iter().fold(
            HealthMonitor::new(
                warehouse,
                ledger,
                config.ledger().lease_timeout(),
                FallbackClient::new(client, settings.trigger_timeout()),
                sink,
            ),
            |monitor, (key, table)| monitor.with_table(key.clone(), table.clone()),
        );

        Ok(Self {
            key: TableKey::new("monitor"),
            monitor,
            interval: settings.poll_interval(),
            context,
        })
    }
}

impl Pipeline for MonitorPipeline {
    type Key = TableKey;
    type Error = MonitorError;

    fn key(&self) -> &Self::Key {
        &self.key
    }

    async fn run(self) -> Result<(), Self::Error> {
        let interval = self.interval + random_jitter(self.context.poll_jitter_secs);
        info!(
            tables = self.monitor.table_count(),
            interval_secs = interval.as_secs(),
            "Monitor initialized"
        );
        let mut processor = MonitorProcessor {
            monitor: self.monitor,
        };
        run_polling_loop(
            &mut processor,
            interval,
            self.context.poll_jitter_secs,
            self.context.shutdown,
            self.key.id(),
            "ferry-monitor",
        )
        .await
    }
}

impl AppConfig for Config {
    type Pipeline = MonitorPipeline;
    type BuildError = MonitorError;

    const COMPONENT_NAME: &'static str = "monitor";

    fn from_paths(paths: &[ConfigPath]) -> Result<Self, ConfigError> {
        Config::load(paths)
    }

    fn create_pipelines(&self, context: PipelineContext) -> Result<Vec<MonitorPipeline>, MonitorError> {
        if self.tables.is_empty() {
            warn!("No tables configured");
            return Ok(Vec::new());
        }
        Ok(vec![MonitorPipeline::from_config(self, context)?])
    }

    fn log_startup_info(&self) {
        let settings = self.settings();
        info!(
            "Starting ferry-monitor with {} table(s), every {}s",
            self.table_count(),
            settings.poll_interval_secs
        );
        for (key, table) in &self.tables {
            info!(
                "  Table: {} ({}.{}, warn > {}d, critical > {}d, fallback {})",
                key,
                table.target_table,
                table.freshness_column,
                table.warning_threshold_days,
                table.critical_threshold_days,
                table.fallback.as_ref().map_or("none", |f| f.url.as_str())
            );
        }
        if let Some(url) = &settings.alert_webhook {
            info!("  Alerts: {url}");
        }
    }
}
