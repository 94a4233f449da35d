//! Bounded pool of source connections.
//!
//! At most `max_connections` connections are checked out at once; further
//! callers wait on the semaphore. Idle connections are reused most-recent
//! first and optionally pinged before being handed out. Connecting and
//! querying retry transient failures under the pool's [`RetryPolicy`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ferry_core::RetryPolicy;
use ferry_core::emit;
use ferry_core::retry::with_retry;
use snafu::prelude::*;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::credentials::CredentialProvider;
use crate::error::{CredentialsSnafu, PoolError, SourceError};
use crate::metrics::events::{ConnectionRetried, PoolConnections};
use crate::schema::SourceColumn;
use crate::source::{ExtractQuery, SourceConnection, SourceConnector, SourceTableRef};
use crate::value::{Batch, RangeFilter};

/// Pool sizing and checkout behavior.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_connections: usize,
    pub validate_on_checkout: bool,
    pub retry: RetryPolicy,
    /// Label for logs and metrics.
    pub label: String,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 3,
            validate_on_checkout: true,
            retry: RetryPolicy::default(),
            label: "source".to_string(),
        }
    }
}

struct PoolInner {
    connector: Arc<dyn SourceConnector>,
    credentials: Arc<CredentialProvider>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn SourceConnection>>>,
    options: PoolOptions,
}

impl PoolInner {
    fn report(&self) {
        let idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner).len();
        let in_use = self
            .options
            .max_connections
            .saturating_sub(self.permits.available_permits());
        emit!(PoolConnections {
            pool: self.options.label.clone(),
            idle,
            in_use,
        });
    }
}

/// Cloneable handle to a shared connection pool.
#[derive(Clone)]
pub struct SourcePool {
    inner: Arc<PoolInner>,
}

impl SourcePool {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        credentials: Arc<CredentialProvider>,
        options: PoolOptions,
    ) -> Self {
        let options = PoolOptions {
            max_connections: options.max_connections.max(1),
            ..options
        };
        Self {
            inner: Arc::new(PoolInner {
                connector,
                credentials,
                permits: Arc::new(Semaphore::new(options.max_connections)),
                idle: Mutex::new(Vec::new()),
                options,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.options.label
    }

    pub fn idle_count(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check out a connection, waiting for capacity when the pool is full.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        while let Some(mut conn) = self.pop_idle() {
            if conn.is_closed() {
                debug!(pool = %self.label(), "Dropping closed idle connection");
                continue;
            }
            if self.inner.options.validate_on_checkout
                && let Err(e) = conn.ping().await
            {
                debug!(pool = %self.label(), error = %e, "Idle connection failed validation");
                continue;
            }
            return Ok(self.wrap(conn, permit));
        }

        let conn = self.connect().await?;
        Ok(self.wrap(conn, permit))
    }

    /// Introspect a source table.
    pub async fn describe(&self, table: &SourceTableRef) -> Result<Vec<SourceColumn>, PoolError> {
        let attempts = &AtomicUsize::new(0);
        with_retry(
            &self.inner.options.retry,
            move || async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let mut conn = self.acquire().await?;
                let result = conn.describe_table(table).await;
                conn.settle(result, "describe", attempt)
            },
            PoolError::is_transient,
            |attempt, e| self.on_retry("describe", attempt, e),
        )
        .await
    }

    /// Run one extraction query.
    pub async fn fetch(&self, query: &ExtractQuery) -> Result<Batch, PoolError> {
        let attempts = &AtomicUsize::new(0);
        with_retry(
            &self.inner.options.retry,
            move || async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let mut conn = self.acquire().await?;
                let result = conn.fetch(query).await;
                conn.settle(result, "fetch", attempt)
            },
            PoolError::is_transient,
            |attempt, e| self.on_retry("fetch", attempt, e),
        )
        .await
    }

    /// Count source rows, optionally within a window.
    pub async fn count(
        &self,
        table: &SourceTableRef,
        filter: Option<&RangeFilter>,
    ) -> Result<u64, PoolError> {
        let attempts = &AtomicUsize::new(0);
        with_retry(
            &self.inner.options.retry,
            move || async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let mut conn = self.acquire().await?;
                let result = conn.count(table, filter).await;
                conn.settle(result, "count", attempt)
            },
            PoolError::is_transient,
            |attempt, e| self.on_retry("count", attempt, e),
        )
        .await
    }

    /// Drop idle connections and refuse further checkouts.
    pub fn close_all(&self) {
        self.inner.permits.close();
        let drained = std::mem::take(
            &mut *self
                .inner
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        debug!(pool = %self.label(), closed = drained.len(), "Closed idle connections");
    }

    fn pop_idle(&self) -> Option<Box<dyn SourceConnection>> {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    fn wrap(&self, conn: Box<dyn SourceConnection>, permit: OwnedSemaphorePermit) -> PooledConnection {
        let pooled = PooledConnection {
            conn,
            pool: self.inner.clone(),
            _permit: permit,
        };
        self.inner.report();
        pooled
    }

    async fn connect(&self) -> Result<Box<dyn SourceConnection>, PoolError> {
        let params = self
            .inner
            .credentials
            .connection_params()
            .await
            .context(CredentialsSnafu)?;
        let params = &params;
        let connector = &self.inner.connector;
        let attempts = &AtomicUsize::new(0);

        with_retry(
            &self.inner.options.retry,
            move || {
                attempts.fetch_add(1, Ordering::Relaxed);
                connector.connect(params)
            },
            SourceError::is_transient,
            |attempt, e| self.on_retry("connect", attempt, e),
        )
        .await
        .map_err(|source| PoolError::Exhausted {
            attempts: attempts.load(Ordering::Relaxed),
            source,
        })
    }

    fn on_retry(&self, operation: &'static str, attempt: usize, error: &dyn std::fmt::Display) {
        warn!(
            pool = %self.label(),
            operation,
            attempt,
            error = %error,
            "Transient source error, retrying"
        );
        emit!(ConnectionRetried {
            operation,
            pool: self.label().to_string(),
        });
    }
}

/// A checked-out connection. Holds one pool permit until dropped.
///
/// Call [`PooledConnection::release`] to return a healthy connection to the
/// idle list; dropping the guard closes the connection instead.
pub struct PooledConnection {
    conn: Box<dyn SourceConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Return the connection to the idle list unless it reports itself closed.
    pub fn release(self) {
        if self.conn.is_closed() {
            return;
        }
        self.pool
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.conn);
    }

    /// Close the connection instead of returning it.
    pub fn discard(self) {}

    /// Release or discard depending on how the call went.
    fn settle<T>(
        self,
        result: Result<T, SourceError>,
        operation: &'static str,
        attempt: usize,
    ) -> Result<T, PoolError> {
        match result {
            Ok(value) => {
                self.release();
                Ok(value)
            }
            Err(source) => {
                if source.is_transient() {
                    self.discard();
                } else {
                    self.release();
                }
                Err(PoolError::Operation {
                    operation,
                    attempts: attempt,
                    source,
                })
            }
        }
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn SourceConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemorySource;
    use crate::credentials::{DEFAULT_CACHE_TTL, StaticSecretStore};
    use crate::schema::SourceColumn;
    use crate::source::Page;
    use crate::value::Value;
    use std::time::Duration;

    fn credentials() -> Arc<CredentialProvider> {
        Arc::new(CredentialProvider::new(
            Arc::new(StaticSecretStore::new().with("SOURCE_ACCOUNT", "acct")),
            DEFAULT_CACHE_TTL,
        )
        .require("account", "SOURCE_ACCOUNT"))
    }

    fn options(max_connections: usize) -> PoolOptions {
        PoolOptions {
            max_connections,
            validate_on_checkout: true,
            retry: RetryPolicy {
                jitter: 0.0,
                ..RetryPolicy::exponential(3, Duration::from_millis(1))
            },
            label: "test".into(),
        }
    }

    fn source() -> MemorySource {
        let source = MemorySource::new();
        source.create_table(
            "ITEMS",
            vec![SourceColumn::new("ID", "NUMBER(38,0)")],
            (1..=5).map(|i| vec![Value::Int(i)]).collect(),
        );
        source
    }

    fn query() -> ExtractQuery {
        ExtractQuery::new(
            SourceTableRef::new("ITEMS"),
            None,
            vec!["ID".into()],
            Page::Offset {
                offset: 0,
                limit: 10,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_connections_are_reused() {
        let source = source();
        let pool = SourcePool::new(Arc::new(source.clone()), credentials(), options(2));

        pool.fetch(&query()).await.unwrap();
        pool.fetch(&query()).await.unwrap();

        assert_eq!(source.connects(), 1);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_connect_failures_are_retried() {
        let source = source();
        source.fail_connects(2);
        let pool = SourcePool::new(Arc::new(source.clone()), credentials(), options(1));

        let batch = pool.fetch(&query()).await.unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(source.connects(), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_max_attempts() {
        let source = source();
        source.fail_connects(10);
        let pool = SourcePool::new(Arc::new(source), credentials(), options(1));

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, PoolError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_missing_credentials_are_not_retried() {
        let source = source();
        let credentials = Arc::new(
            CredentialProvider::new(Arc::new(StaticSecretStore::new()), DEFAULT_CACHE_TTL)
                .require("account", "SOURCE_ACCOUNT"),
        );
        let pool = SourcePool::new(Arc::new(source.clone()), credentials, options(1));

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, PoolError::Credentials { .. }));
        assert_eq!(source.connects(), 0);
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_capacity() {
        let pool = SourcePool::new(Arc::new(source()), credentials(), options(1));

        let held = pool.acquire().await.unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(waiting.is_err());

        held.release();
        let second = tokio::time::timeout(Duration::from_secs(1), pool.acquire()).await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_checkout() {
        let pool = SourcePool::new(Arc::new(source()), credentials(), options(1));
        pool.close_all();
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }
}
