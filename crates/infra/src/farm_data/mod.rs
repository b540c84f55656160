//! Adapters for the farm history the feature builder reads.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryFarmData;
pub use postgres::PostgresFarmData;
