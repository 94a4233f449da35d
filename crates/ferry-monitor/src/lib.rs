//! ferry-monitor: freshness and health checks for tables kept by `ferry`.
//!
//! Every poll reads the row count and latest freshness value of each
//! monitored table, classifies it against warning and critical day
//! thresholds, and for critical tables asks the sync engine for a fallback
//! sync unless the ledger shows one already running. Tables can also opt
//! into a sync history check against the ledger and a duplicate key check.
//! Alerts go to the log and, optionally, to a JSON webhook.

pub mod alert;
pub mod checks;
pub mod config;
pub mod error;
pub mod fallback;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod pipeline;

pub use alert::{Alert, AlertSink, LogAlertSink, Severity, WebhookAlertSink};
pub use checks::{DuplicateHealth, OrchestrationHealth};
pub use config::{Config, MonitoredTable, OrchestrationConfig};
pub use error::MonitorError;
pub use fallback::{FallbackClient, FallbackRequest};
pub use health::{HealthStatus, TableHealth};
pub use monitor::{HealthMonitor, MonitorReport};
pub use pipeline::MonitorPipeline;
