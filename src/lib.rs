//! Client-side persistence and sync: debounced autosave, a durable local
//! cache, signed download URL reuse and cache-first reads.

pub mod autosave;
pub mod cache;
pub mod config;
pub mod logging;
pub mod session;
pub mod signed_url;

#[cfg(test)]
mod testing;
