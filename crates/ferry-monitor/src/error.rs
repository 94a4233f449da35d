//! Error types for the monitor.

use snafu::prelude::*;

use ferry::PipelineError;
use ferry::error::WarehouseError;
pub use ferry_core::ConfigError;

/// Errors building or running the monitor service.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MonitorError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Failed to open warehouse: {source}"))]
    OpenWarehouse { source: PipelineError },

    #[snafu(display("Failed to build HTTP client: {source}"))]
    HttpClient { source: reqwest::Error },
}

impl From<ConfigError> for MonitorError {
    fn from(source: ConfigError) -> Self {
        MonitorError::Config { source }
    }
}

/// Errors probing one table. Reported as an `ERROR` health status.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProbeError {
    #[snafu(display("Failed to read stats of '{table}': {source}"))]
    Stats {
        table: String,
        source: WarehouseError,
    },

    #[snafu(display("Unparseable freshness value '{value}' in '{table}'"))]
    UnparseableLatest { table: String, value: String },
}

/// Errors requesting a fallback sync.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TriggerError {
    #[snafu(display("Fallback request to {url} failed: {source}"))]
    Request { url: String, source: reqwest::Error },

    #[snafu(display("Fallback request to {url} returned HTTP {status}: {body}"))]
    Rejected {
        url: String,
        status: u16,
        body: String,
    },
}

/// Errors delivering an alert.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AlertError {
    #[snafu(display("Alert webhook {url} failed: {source}"))]
    Webhook { url: String, source: reqwest::Error },

    #[snafu(display("Alert webhook {url} returned HTTP {status}"))]
    WebhookStatus { url: String, status: u16 },
}
