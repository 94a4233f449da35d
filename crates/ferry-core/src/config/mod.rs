//! Configuration types shared by the sync engine and the monitor.

mod component_key;
mod global;
mod loader;
mod path;
mod resource;
mod vars;

pub use component_key::ComponentKey;
pub use global::GlobalConfig;
pub use loader::{Mergeable, load_from_paths, merge_singleton, parse_str};
pub use path::{CliArgs, ConfigPath};
pub use resource::Resource;
pub use vars::interpolate;

use serde::{Deserialize, Serialize};

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
        }
    }
}

impl MetricsConfig {
    /// Merge values from another MetricsConfig (last-write-wins).
    pub fn merge_from(&mut self, other: Self) {
        if other.address != default_metrics_address() {
            self.address = other.address;
        }
    }
}

fn default_metrics_address() -> String {
    crate::metrics::DEFAULT_METRICS_ADDR.to_string()
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration. Filtering stays with `RUST_LOG`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn merge_from(&mut self, other: Self) {
        if other.format != LogFormat::default() {
            self.format = other.format;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default_address() {
        let config: MetricsConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.address, "0.0.0.0:9090");
    }

    #[test]
    fn test_logging_format_parse_and_merge() {
        let mut base: LoggingConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(base.format, LogFormat::Text);

        let json: LoggingConfig = serde_yaml::from_str("format: json").unwrap();
        base.merge_from(json);
        assert_eq!(base.format, LogFormat::Json);
    }
}
