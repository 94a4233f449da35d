//! Generic polling loop trait and runner.
//!
//! Scheduled table syncs and the health monitor are both "do some work, sleep,
//! repeat until shutdown" loops; this module owns that shape.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationDuration, IterationResultType};
use crate::topology::random_jitter;

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Work was done.
    ProcessedItems,
    /// Nothing was due this iteration.
    NoItems,
    /// Shutdown was requested.
    Shutdown,
}

/// Trait for implementing a polling-based processor.
#[async_trait]
pub trait PollingProcessor {
    /// The state type prepared for each iteration.
    type State: Send;
    /// The error type for this processor.
    type Error: std::error::Error + Send;

    /// Decide whether there is work this iteration.
    ///
    /// Returns `None` when nothing is due. `cold_start` is true only on the
    /// first iteration after startup.
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Do the work prepared by [`PollingProcessor::prepare`].
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Run `processor` every `poll_interval` (plus up to `poll_jitter_secs` of
/// jitter) until `shutdown` is cancelled.
///
/// Errors returned by the processor end the loop; processors that must keep
/// polling after a failed iteration handle the failure themselves.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: CancellationToken,
    name: &str,
    service: &'static str,
) -> Result<(), P::Error> {
    let mut first_iteration = true;

    loop {
        let iteration_start = Instant::now();
        let cold_start = std::mem::replace(&mut first_iteration, false);

        let state = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target = name, "Shutdown requested during prepare");
                return Ok(());
            }

            result = processor.prepare(cold_start) => result?,
        };

        let result = match state {
            Some(s) => {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!(target = name, "Shutdown requested during processing");
                        IterationResult::Shutdown
                    }

                    result = processor.process(s) => result?,
                }
            }
            None => IterationResult::NoItems,
        };

        let result_type = match result {
            IterationResult::Shutdown => break,
            IterationResult::NoItems => IterationResultType::NoItems,
            IterationResult::ProcessedItems => IterationResultType::Processed,
        };

        emit!(IterationCompleted {
            service,
            result: result_type,
            target: name.to_string(),
        });
        emit!(IterationDuration {
            service,
            duration: iteration_start.elapsed(),
            target: name.to_string(),
        });

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        debug!(
            target = name,
            wait_secs = sleep_duration.as_secs(),
            "Iteration complete, waiting for next poll"
        );
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Never;

    impl fmt::Display for Never {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "never")
        }
    }

    impl std::error::Error for Never {}

    struct Counting {
        prepared: usize,
        processed: usize,
        cold_starts: usize,
        stop_after: usize,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl PollingProcessor for Counting {
        type State = ();
        type Error = Never;

        async fn prepare(&mut self, cold_start: bool) -> Result<Option<()>, Never> {
            self.prepared += 1;
            if cold_start {
                self.cold_starts += 1;
            }
            // Every other iteration has nothing due.
            Ok((self.prepared % 2 == 1).then_some(()))
        }

        async fn process(&mut self, _state: ()) -> Result<IterationResult, Never> {
            self.processed += 1;
            if self.processed >= self.stop_after {
                self.shutdown.cancel();
            }
            Ok(IterationResult::ProcessedItems)
        }
    }

    #[tokio::test]
    async fn test_loop_runs_until_shutdown() {
        crate::metrics::init_test();
        let shutdown = CancellationToken::new();
        let mut processor = Counting {
            prepared: 0,
            processed: 0,
            cold_starts: 0,
            stop_after: 2,
            shutdown: shutdown.clone(),
        };

        run_polling_loop(
            &mut processor,
            Duration::from_millis(1),
            0,
            shutdown,
            "test",
            "ferry",
        )
        .await
        .unwrap();

        assert_eq!(processor.processed, 2);
        assert_eq!(processor.prepared, 3);
        assert_eq!(processor.cold_starts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_nothing() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let mut processor = Counting {
            prepared: 0,
            processed: 0,
            cold_starts: 0,
            stop_after: 1,
            shutdown: shutdown.clone(),
        };

        run_polling_loop(&mut processor, Duration::from_secs(60), 0, shutdown, "test", "ferry")
            .await
            .unwrap();
        assert_eq!(processor.prepared, 0);
    }
}
