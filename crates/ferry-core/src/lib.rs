//! ferry-core: runtime pieces shared by the `ferry` sync engine and `ferry-monitor`.
//!
//! - `config/` - multi-file YAML loading, env interpolation, component keys, resource claims
//! - `metrics/` - Prometheus exporter and the `emit!` event pattern
//! - `topology/` - running many keyed pipelines with jittered starts and shared shutdown
//! - `polling` - the scheduled control loop both binaries are built on
//! - `retry` - bounded exponential backoff for transient failures
//! - `app` - `Application` runner that reduces `main.rs` to one call

pub mod app;
pub mod config;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod retry;
pub mod signal;
pub mod topology;
pub mod tracing;

pub use app::{AppConfig, Application};
pub use config::{
    CliArgs, ComponentKey, ConfigPath, GlobalConfig, LogFormat, LoggingConfig, Mergeable,
    MetricsConfig, Resource,
};
pub use error::{ConfigError, MetricsError, PipelineSetupError};
pub use metrics::{
    DEFAULT_METRICS_ADDR, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use polling::{IterationResult, PollingProcessor, run_polling_loop};
pub use retry::{RetryConfig, RetryPolicy};
pub use signal::{cancel_on_signal, shutdown_signal};
pub use topology::{Pipeline, PipelineContext, PipelineRunner, random_jitter, run_pipelines};
pub use tracing::init_tracing;
