//! Metric events emitted by the sync engine.
//!
//! Events implement [`ferry_core::metrics::events::InternalEvent`] and are
//! emitted with [`ferry_core::emit!`].

pub mod events;

pub use events::*;
