//! Versioned cache partitions for the offline agent.
//!
//! This module provides:
//! - Named partitions per version tag (core assets, offline page, API responses)
//! - Install (atomic manifest pre-cache) and activate (stale partition sweep)
//! - GET-only storage of captured responses keyed by method + URL
//! - SQLite persistence shared with the offline mutation queue

mod layer;
mod storage;
mod traits;

pub use layer::{ActivateReport, CacheLayer, InstallReport, PartitionKind, Partitions};
pub use storage::{CacheStorage, QueueStorage, SqliteStorage};
pub use traits::{CachedResponse, RequestKey, ResponseSource};
