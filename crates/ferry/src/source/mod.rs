//! Source warehouse access: connections, queries and batch extraction.

mod extractor;
mod query;

pub use extractor::{BatchExtractor, ExtractPlan, ExtractProgress, Extracted, Pagination};
pub use query::{ExtractQuery, Page, quote_ident, render_literal};

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::ConnectionParams;
use crate::error::SourceError;
use crate::schema::SourceColumn;
use crate::value::{Batch, RangeFilter};

/// A table in the source warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceTableRef {
    #[serde(default)]
    pub schema: Option<String>,
    pub name: String,
}

impl SourceTableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

impl fmt::Display for SourceTableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// An open connection to the source warehouse.
#[async_trait]
pub trait SourceConnection: Send {
    /// Column names and declared types, in table order.
    async fn describe_table(
        &mut self,
        table: &SourceTableRef,
    ) -> Result<Vec<SourceColumn>, SourceError>;

    /// Run one extraction query.
    async fn fetch(&mut self, query: &ExtractQuery) -> Result<Batch, SourceError>;

    /// Count rows, optionally within a date window.
    async fn count(
        &mut self,
        table: &SourceTableRef,
        filter: Option<&RangeFilter>,
    ) -> Result<u64, SourceError>;

    /// Cheap liveness check used when a pooled connection is checked out.
    async fn ping(&mut self) -> Result<(), SourceError>;

    /// Whether the driver already knows the connection is unusable.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Opens source connections from resolved credentials.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Box<dyn SourceConnection>, SourceError>;
}
