//! Error types for the sync engine.
//!
//! Each stage owns its error enum. [`SyncError`] is the invocation-level error
//! the orchestrator converts into a failed outcome; it is never returned raw to
//! a trigger caller.

use snafu::prelude::*;

pub use ferry_core::error::{ConfigError, MetricsError, PipelineSetupError};

/// Errors resolving secrets into connection parameters. Never retried.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CredentialError {
    /// A required secret is absent or empty.
    #[snafu(display("Required credential '{name}' is missing or empty"))]
    Missing { name: String },

    /// The secret store itself failed.
    #[snafu(display("Secret store lookup for '{name}' failed: {message}"))]
    Store { name: String, message: String },

    /// Reading a file-backed secret failed.
    #[snafu(display("Failed to read secret file for '{name}': {source}"))]
    SecretFile {
        name: String,
        source: std::io::Error,
    },
}

/// Errors raised by a source connection.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// The connection could not be established or was lost.
    #[snafu(display("Source connection failed: {message}"))]
    Connection { message: String },

    /// The source did not answer in time.
    #[snafu(display("Source timed out: {message}"))]
    Timeout { message: String },

    /// The source rejected a statement.
    #[snafu(display("Source query failed: {message}"))]
    Query { message: String },

    /// The table does not exist in the source.
    #[snafu(display("Source table '{table}' not found"))]
    SourceTableNotFound { table: String },

    /// A value could not be decoded into its declared type.
    #[snafu(display("Failed to decode column '{column}': {message}"))]
    Decode { column: String, message: String },

    /// SQLite driver error.
    #[snafu(display("SQLite error: {source}"))]
    SourceSqlite { source: rusqlite::Error },

    /// Blocking driver task failed.
    #[snafu(display("Source task failed: {source}"))]
    SourceTask { source: tokio::task::JoinError },
}

impl SourceError {
    /// Whether retrying the same call on a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Connection { .. } | SourceError::Timeout { .. } => true,
            SourceError::SourceSqlite { source } => matches!(
                source.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

/// Errors from the source connection pool.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PoolError {
    /// Connection parameters could not be resolved.
    #[snafu(display("Credential error: {source}"))]
    Credentials { source: CredentialError },

    /// Connecting failed after every allowed attempt.
    #[snafu(display("Could not connect to source after {attempts} attempt(s): {source}"))]
    Exhausted { attempts: usize, source: SourceError },

    /// A source call failed (after retries if the error was transient).
    #[snafu(display("Source {operation} failed after {attempts} attempt(s): {source}"))]
    Operation {
        operation: &'static str,
        attempts: usize,
        source: SourceError,
    },

    /// The pool was closed during shutdown.
    #[snafu(display("Connection pool is closed"))]
    Closed,
}

impl PoolError {
    /// Whether the failed call may succeed on a fresh connection.
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::Operation { source, .. } if source.is_transient())
    }
}

/// Errors from the batch extractor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExtractError {
    /// Fetching a batch failed.
    #[snafu(display("Extraction failed at {position}: {source}"))]
    Fetch { position: String, source: PoolError },

    /// A paginated query was built without an ordering.
    #[snafu(display("Paginated extraction of '{table}' requires an ORDER BY"))]
    MissingOrdering { table: String },

    /// Cursor pagination could not find its column in a batch.
    #[snafu(display("Cursor column '{column}' missing from extracted batch"))]
    CursorColumnMissing { column: String },
}

/// Errors shaping source rows into staged records.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum NormalizeError {
    /// A decimal value is not a decimal.
    #[snafu(display("Column '{column}' holds an invalid decimal '{value}'"))]
    InvalidDecimal { column: String, value: String },

    /// A key column is null.
    #[snafu(display("Row {row} has a null key column '{column}'"))]
    NullKey { column: String, row: usize },

    /// A partition column is null and the policy rejects it.
    #[snafu(display("Row {row} has a null partition column '{column}'"))]
    NullPartition { column: String, row: usize },

    /// A key column does not exist in the target schema.
    #[snafu(display("Key column '{column}' is not part of the target schema"))]
    UnknownKeyColumn { column: String },
}

/// Errors from a warehouse backend.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarehouseError {
    /// The table does not exist.
    #[snafu(display("Table '{table}' not found"))]
    TableNotFound { table: String },

    /// The table already exists.
    #[snafu(display("Table '{table}' already exists"))]
    TableExists { table: String },

    /// A record or statement names a column the table does not have.
    #[snafu(display("Table '{table}' has no column '{column}'"))]
    UnknownColumn { table: String, column: String },

    /// SQLite driver error.
    #[snafu(display("SQLite error: {source}"))]
    Sqlite { source: rusqlite::Error },

    /// Blocking driver task failed.
    #[snafu(display("Warehouse task failed: {source}"))]
    Task { source: tokio::task::JoinError },

    /// A lock guarding backend state was poisoned by a panic.
    #[snafu(display("Warehouse state lock poisoned"))]
    Poisoned,

    /// Stored table metadata could not be decoded.
    #[snafu(display("Invalid catalog entry for '{table}': {source}"))]
    Catalog {
        table: String,
        source: serde_json::Error,
    },

    /// Failure injected by a test backend.
    #[snafu(display("Injected {operation} failure on '{table}'"))]
    InjectedFault {
        operation: &'static str,
        table: String,
    },
}

/// Errors from the staging loader.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StagingError {
    /// Creating the staging table failed.
    #[snafu(display("Failed to create staging table '{table}': {source}"))]
    CreateStaging {
        table: String,
        source: WarehouseError,
    },

    /// Appending a batch failed; the staging contents must not be reconciled.
    #[snafu(display("Failed to append batch {batch} to staging table '{table}': {source}"))]
    Append {
        table: String,
        batch: u64,
        source: WarehouseError,
    },

    /// Dropping the staging table failed.
    #[snafu(display("Failed to drop staging table '{table}': {source}"))]
    DropStaging {
        table: String,
        source: WarehouseError,
    },
}

/// Errors from the reconciler. Any of these leaves the target needing inspection.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReconcileError {
    /// MERGE mode requires key columns.
    #[snafu(display("MERGE into '{target}' requires key columns"))]
    NoKeyColumns { target: String },

    #[snafu(display("MERGE into '{target}' failed: {source}"))]
    Merge {
        target: String,
        source: WarehouseError,
    },

    #[snafu(display("REPLACE of '{target}' failed: {source}"))]
    Replace {
        target: String,
        source: WarehouseError,
    },

    #[snafu(display("Stale-row cleanup on '{target}' failed: {source}"))]
    StaleCleanup {
        target: String,
        source: WarehouseError,
    },

    #[snafu(display("Deduplication of '{target}' failed: {source}"))]
    Deduplicate {
        target: String,
        source: WarehouseError,
    },
}

/// Errors reading or writing sync records.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LedgerError {
    #[snafu(display("Sync record store failed: {source}"))]
    RecordStore { source: WarehouseError },

    #[snafu(display("Invalid sync record '{sync_id}': {message}"))]
    InvalidRecord { sync_id: String, message: String },
}

/// Broad failure categories reported in outcomes and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Credential,
    Connection,
    Extraction,
    Target,
    Staging,
    Reconcile,
    Ledger,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Credential => "credential",
            ErrorKind::Connection => "connection",
            ErrorKind::Extraction => "extraction",
            ErrorKind::Target => "target",
            ErrorKind::Staging => "staging",
            ErrorKind::Reconcile => "reconcile",
            ErrorKind::Ledger => "ledger",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Invocation-level sync errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SyncError {
    #[snafu(display("Invalid sync request: {message}"))]
    InvalidRequest { message: String },

    #[snafu(display("Failed to introspect source table: {source}"))]
    Introspect { source: PoolError },

    #[snafu(display("Failed to prepare target table '{target}': {source}"))]
    TargetSetup {
        target: String,
        source: WarehouseError,
    },

    #[snafu(display("{source}"))]
    Extraction { source: ExtractError },

    #[snafu(display("Failed to normalize batch: {source}"))]
    Normalize { source: NormalizeError },

    #[snafu(display("{source}"))]
    Staging { source: StagingError },

    #[snafu(display("{source}"))]
    Reconcile { source: ReconcileError },

    #[snafu(display("{source}"))]
    Ledger { source: LedgerError },

    #[snafu(display("Sync panicked: {message}"))]
    Panicked { message: String },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        fn pool_kind(error: &PoolError) -> ErrorKind {
            match error {
                PoolError::Credentials { .. } => ErrorKind::Credential,
                PoolError::Exhausted { .. } | PoolError::Closed => ErrorKind::Connection,
                PoolError::Operation { .. } => ErrorKind::Extraction,
            }
        }

        match self {
            SyncError::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            SyncError::Introspect { source } => pool_kind(source),
            SyncError::Extraction {
                source: ExtractError::Fetch { source, .. },
            } => pool_kind(source),
            SyncError::Extraction { .. } => ErrorKind::Extraction,
            SyncError::TargetSetup { .. } => ErrorKind::Target,
            SyncError::Normalize { .. } | SyncError::Staging { .. } => ErrorKind::Staging,
            SyncError::Reconcile { .. } => ErrorKind::Reconcile,
            SyncError::Ledger { .. } => ErrorKind::Ledger,
            SyncError::Panicked { .. } => ErrorKind::Internal,
        }
    }
}

/// Errors building or running the `ferry` service.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    #[snafu(display("Failed to open warehouse: {source}"))]
    OpenWarehouse { source: WarehouseError },

    #[snafu(display("Failed to bind trigger server on {address}: {source}"))]
    TriggerBind {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("Trigger server failed: {source}"))]
    TriggerServe { source: std::io::Error },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}
