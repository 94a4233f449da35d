//! Metric events emitted by the monitor.

pub mod events;

pub use events::*;
