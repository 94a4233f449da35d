//! Ferry: chunked extract-stage-merge sync from a source warehouse into an
//! analytical warehouse.
//!
//! This crate handles:
//! - Resolving connection credentials and pooling source connections
//! - Mapping source schemas onto target tables through one shared type table
//! - Paginated batch extraction with a wall-clock budget
//! - Normalizing rows and loading them into expiring staging tables
//! - Atomic MERGE or REPLACE of staging into the target, with guarded stale-row cleanup
//! - Sync records that resume chunked syncs and act as a per-table lease
//! - Scheduled runs and an HTTP trigger surface

pub mod backend;
pub mod config;
pub mod credentials;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod reconcile;
pub mod schema;
pub mod source;
pub mod staging;
pub mod trigger;
pub mod validate;
pub mod value;
pub mod warehouse;

// Re-export commonly used items
pub use config::{Config, TableConfig, TableKey};
pub use error::{PipelineError, SyncError};
pub use orchestrator::{OutcomeStatus, SyncOrchestrator, SyncOutcome, SyncRequest};
pub use pipeline::{Backends, FerryPipeline, open_warehouse};
pub use warehouse::Warehouse;

pub use ferry_core::{Application, CliArgs, init_metrics, init_tracing, shutdown_signal};
