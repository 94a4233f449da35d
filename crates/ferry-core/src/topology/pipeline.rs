//! Pipeline orchestration primitives.
//!
//! Runs a set of independent pipelines concurrently with jittered starts, a
//! shared shutdown token, and an optional process-wide concurrency cap.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use snafu::ResultExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::GlobalConfig;
use crate::error::{AddressParseSnafu, MetricsSnafu, PipelineSetupError};
use crate::signal::cancel_on_signal;

/// Shared resources for pipeline execution.
#[derive(Clone)]
pub struct PipelineContext {
    /// Optional global semaphore for cross-pipeline concurrency limiting.
    pub global_semaphore: Option<Arc<Semaphore>>,
    /// Maximum jitter in seconds to add to poll intervals.
    pub poll_jitter_secs: u64,
    /// Cancellation token for graceful shutdown.
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    pub fn new(
        total_concurrency: Option<usize>,
        poll_jitter_secs: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            global_semaphore: total_concurrency.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            poll_jitter_secs,
            shutdown,
        }
    }

    /// Wait for a global work slot. `None` when no cap is configured.
    ///
    /// Returns `None` as well if the semaphore was closed, which only happens
    /// during shutdown.
    pub async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        match &self.global_semaphore {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        }
    }
}

/// A self-contained pipeline unit that can be executed.
pub trait Pipeline: Send + 'static {
    /// The key type used to identify this pipeline.
    type Key: Clone + Display + Send + 'static;

    /// The error type returned by this pipeline.
    type Error: std::error::Error + Send + 'static;

    fn key(&self) -> &Self::Key;

    /// Run this pipeline until it finishes or shutdown is requested.
    fn run(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Orchestrates multiple pipeline executions with shared shutdown handling.
pub struct PipelineRunner<P: Pipeline> {
    pipelines: Vec<P>,
    shutdown: CancellationToken,
    poll_jitter_secs: u64,
    typetag: &'static str,
}

impl<P: Pipeline> PipelineRunner<P> {
    pub fn new(
        pipelines: Vec<P>,
        shutdown: CancellationToken,
        poll_jitter_secs: u64,
        typetag: &'static str,
    ) -> Self {
        Self {
            pipelines,
            shutdown,
            poll_jitter_secs,
            typetag,
        }
    }

    /// Cancel the shared token when the process receives a shutdown signal.
    pub fn spawn_shutdown_handler(&self) {
        drop(cancel_on_signal(self.shutdown.clone()));
    }

    /// Run all pipelines to completion.
    ///
    /// Returns the number of pipelines that failed or panicked.
    pub async fn run(self) -> usize {
        let mut handles: JoinSet<(P::Key, Result<(), P::Error>)> = JoinSet::new();
        let typetag = self.typetag;

        for pipeline in self.pipelines {
            let shutdown = self.shutdown.clone();
            let key = pipeline.key().clone();
            let start_jitter = random_jitter(self.poll_jitter_secs);

            handles.spawn(async move {
                if !start_jitter.is_zero() {
                    info!(
                        target = %key,
                        jitter_secs = start_jitter.as_secs(),
                        "Delaying {} start for jitter", typetag
                    );
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(start_jitter))
                        .await
                        .is_none()
                    {
                        info!(target = %key, "Shutdown requested during jitter delay");
                        return (key, Ok(()));
                    }
                }

                let result = pipeline.run().await;
                (key, result)
            });
        }

        info!("Spawned {} {} tasks", handles.len(), typetag);

        let mut failures = 0;
        while let Some(result) = handles.join_next().await {
            match result {
                Ok((key, Ok(()))) => {
                    info!(target = %key, "{} completed", typetag);
                }
                Ok((key, Err(e))) => {
                    failures += 1;
                    error!(target = %key, error = %e, "{} failed", typetag);
                }
                Err(e) => {
                    failures += 1;
                    error!(error = %e, "{} task panicked", typetag);
                }
            }
        }

        info!("All {}s complete", typetag);
        failures
    }
}

/// Initialize metrics, build pipelines from the shared context, and run them
/// until shutdown.
///
/// `create_pipelines` may fail (for example when a backend cannot be opened);
/// nothing is spawned in that case.
pub async fn run_pipelines<P, F, E>(
    metrics_address: &str,
    global: &GlobalConfig,
    typetag: &'static str,
    create_pipelines: F,
) -> Result<usize, PipelineSetupError>
where
    P: Pipeline,
    E: Display,
    F: FnOnce(PipelineContext) -> Result<Vec<P>, E>,
{
    let addr = metrics_address.parse().context(AddressParseSnafu)?;
    crate::metrics::init_global(addr).await.context(MetricsSnafu)?;

    let shutdown = CancellationToken::new();
    let context = PipelineContext::new(
        global.total_concurrency,
        global.poll_jitter_secs,
        shutdown.clone(),
    );

    let pipelines = create_pipelines(context).map_err(|e| PipelineSetupError::Build {
        typetag,
        message: e.to_string(),
    })?;

    let runner = PipelineRunner::new(pipelines, shutdown, global.poll_jitter_secs, typetag);
    runner.spawn_shutdown_handler();
    Ok(runner.run().await)
}

/// Generate a random jitter duration up to the specified maximum seconds.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}
