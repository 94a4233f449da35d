//! Metrics and observability infrastructure.
//!
//! - `events`: the `InternalEvent` trait and the loop-level events every service emits
//! - `server`: Prometheus recorder plus the `/metrics` and `/health` endpoints

pub mod events;
pub mod server;

pub use server::{DEFAULT_METRICS_ADDR, MetricsController, init_global, init_test};

/// Emit a metric event.
///
/// Calls [`events::InternalEvent::emit`] on the given event, which records the
/// corresponding Prometheus metric.
///
/// ```ignore
/// use ferry_core::emit;
///
/// emit!(IterationCompleted { service: "ferry", result: IterationResultType::Processed, target });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;
