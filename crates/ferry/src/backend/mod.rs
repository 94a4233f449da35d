//! Concrete sources, warehouses and sync record stores.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryLedger, MemorySource, MemoryWarehouse};
pub use sqlite::{SqliteSourceConnector, SqliteWarehouse};
