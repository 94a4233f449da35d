//! Scheduled sync runs on the core polling loop.

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use ferry_core::polling::{IterationResult, PollingProcessor};
use ferry_core::PipelineContext;

use crate::error::PipelineError;
use crate::orchestrator::{SyncOrchestrator, SyncRequest};

/// Runs one scheduled invocation per poll.
///
/// A failed invocation is reported through its outcome and never stops the
/// schedule.
pub(crate) struct TableProcessor {
    orchestrator: SyncOrchestrator,
    context: PipelineContext,
}

impl TableProcessor {
    pub(crate) fn new(orchestrator: SyncOrchestrator, context: PipelineContext) -> Self {
        Self {
            orchestrator,
            context,
        }
    }
}

#[async_trait]
impl PollingProcessor for TableProcessor {
    /// Global concurrency slot held for the run, if a cap is configured.
    type State = Option<OwnedSemaphorePermit>;
    type Error = PipelineError;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error> {
        if cold_start {
            debug!(target = %self.orchestrator.key(), "First scheduled run");
        }
        Ok(Some(self.context.acquire_slot().await))
    }

    async fn process(&mut self, slot: Self::State) -> Result<IterationResult, Self::Error> {
        let outcome = self.orchestrator.run(SyncRequest::scheduled()).await;
        drop(slot);

        if outcome.rows_processed == 0 && !outcome.is_error() {
            Ok(IterationResult::NoItems)
        } else {
            Ok(IterationResult::ProcessedItems)
        }
    }
}
