//! Local caching layer for data persistence and offline support.
//!
//! This module provides:
//! - A durable store for single entities and whole list snapshots
//! - A facade that turns storage failures into cache misses
//! - Cache-first and network-only reads that refresh the store from the network
//!   and hydrate storage keys into signed URLs

mod durable;
mod reconciler;
mod storage;
mod traits;

pub use durable::DurableStore;
pub use reconciler::{ReadPolicy, Reads, Reconciler};
pub use storage::{CacheStats, CacheStorage, CachedEntity, CachedList, SqliteStorage};
pub use traits::{CacheResult, CacheSource, ListKey, QueryKey, Snapshot};
