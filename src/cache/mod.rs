//! Versioned response caches for offline support.
//!
//! This module provides:
//! - Named partitions mapping request identities to buffered responses
//! - SQLite and in-memory storage backends
//! - The network-first and stale-while-revalidate strategies
//! - Platform registration state (deferred tasks, active worker build)

mod layer;
mod memory;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use memory::MemoryStorage;
pub use storage::SqliteStorage;
pub use traits::{CacheResult, CacheStorage, RegistrationStore};

#[cfg(test)]
pub use traits::CacheSource;
