//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Trait for entity snapshots that can be cached, autosaved and hydrated.
///
/// A snapshot is the full editable state of one entity at a point in time.
/// Only identity and content comparison matter here; field semantics belong
/// to the caller.
pub trait Snapshot:
  Clone + Send + Sync + Serialize + DeserializeOwned + PartialEq + 'static
{
  /// Identifier of this entity, provisional or canonical.
  fn identity(&self) -> &str;

  /// Replace the identifier (used when the backend assigns a canonical one).
  fn set_identity(&mut self, id: &str);

  /// Entity type name for storage organization (e.g., "draft", "character")
  fn entity_type() -> &'static str;

  /// Whether this snapshot is worth an automatic save.
  ///
  /// Half-initialized forms (no name, no content) return false so they never
  /// create backend rows unless the user saves explicitly.
  fn is_meaningful(&self) -> bool {
    true
  }

  /// Content comparison used for dirty detection.
  ///
  /// Defaults to structural equality. Override to ignore fields that change
  /// without needing a save (display-only data, local UI flags).
  fn same_content(&self, baseline: &Self) -> bool {
    self == baseline
  }

  /// Storage object keys referenced by this snapshot that need signed URLs.
  fn storage_keys(&self) -> Vec<String> {
    Vec::new()
  }

  /// Attach resolved download URLs, keyed by storage key.
  fn attach_urls(&mut self, _urls: &HashMap<String, String>) {}
}

/// Identity of a cached list (e.g. "entities owned by user X").
pub trait QueryKey {
  /// Stable storage key for this query.
  fn cache_hash(&self) -> String;

  /// Human-readable description, stored alongside the list.
  fn description(&self) -> String;
}

/// Query keys for the lists this crate knows how to cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListKey {
  /// Every entity owned by one user
  OwnedBy { owner: String },
  /// A named collection, optionally narrowed by a search term
  Collection {
    name: String,
    search: Option<String>,
  },
}

impl QueryKey for ListKey {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::OwnedBy { owner } => format!("owned_by:{}", owner),
      Self::Collection { name, search } => format!(
        "collection:{}:{}",
        name,
        search.as_deref().map(normalize_search).unwrap_or_default()
      ),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::OwnedBy { owner } => format!("entities owned by {}", owner),
      Self::Collection {
        name,
        search: Some(search),
      } => format!("collection {} matching {}", name, search),
      Self::Collection { name, search: None } => format!("collection {}", name),
    }
  }
}

/// Trims whitespace and lowercases so equivalent searches share a list.
fn normalize_search(search: &str) -> String {
  search.trim().to_lowercase()
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Whether this delivery came from the local cache rather than the network.
  pub fn is_cached(&self) -> bool {
    self.source != CacheSource::Network
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, older than the stale threshold; a refresh follows
  CacheStale,
  /// Network fetch failed, serving cached data
  Offline,
}
