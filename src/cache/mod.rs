//! Versioned, partitioned response cache for offline support.
//!
//! This module provides:
//! - Named partitions whose names embed the deploy version
//! - A storage trait with SQLite and in-memory backends
//! - Strict FIFO trimming of size-bounded partitions
//! - Cache-first and network-first strategies with offline fallbacks

mod layer;
mod memory;
mod partition;
mod queue;
mod storage;
mod traits;

pub use layer::{prune_stale, trim_partition, CacheLayer};
pub use memory::MemoryStorage;
pub use partition::{PartitionKind, PartitionName, PartitionSet};
pub use queue::EvictionQueue;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CachedResponse, RequestKey, ResponseSource, Served};
