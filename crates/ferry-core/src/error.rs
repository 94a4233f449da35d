//! Error types shared by the sync engine and the monitor.

use snafu::prelude::*;

// ============ Config Errors ============

/// Problems loading `ferry` or `ferry-monitor` configuration.
///
/// Loading keeps going after most of these and reports them together as
/// [`ConfigError::MultipleErrors`], one line per file or table.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("Missing required config section '{section}'"))]
    MissingSection { section: String },

    /// One entry (a table, the warehouse, ...) failed validation.
    #[snafu(display("{component} '{key}': {message}"))]
    InvalidComponent {
        component: String,
        key: String,
        message: String,
    },

    /// Unresolvable `${VAR}` references, one per line.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    /// Two tables write the same target.
    #[snafu(display("Resource conflict: {message}"))]
    ResourceConflict { message: String },

    /// The same table key appears in more than one file.
    #[snafu(display("Duplicate component keys: {}", keys.join(", ")))]
    DuplicateComponents { keys: Vec<String> },

    #[snafu(display("Section '{section}' is defined in more than one config file"))]
    DuplicateSection { section: String },

    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    #[snafu(display("Failed to read directory {}", path.display()))]
    ReadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors starting the metrics recorder and endpoint.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    #[snafu(display("Failed to bind metrics endpoint {addr}: {source}"))]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("Failed to initialize Prometheus recorder"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// A second recorder install in the same process.
    #[snafu(display("Metrics recorder already installed"))]
    AlreadyInitialized,

    #[snafu(display("Metrics recorder not installed"))]
    NotInitialized,
}

// ============ Pipeline Setup Errors ============

/// Startup failures before any pipeline runs. Both binaries exit non-zero.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineSetupError {
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    #[snafu(display("Failed to initialize metrics: {source}"))]
    Metrics { source: MetricsError },

    /// A backend could not be opened or a table could not be wired up.
    #[snafu(display("Failed to build {typetag} pipelines: {message}"))]
    Build {
        typetag: &'static str,
        message: String,
    },
}
