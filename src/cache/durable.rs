//! Durable local store facade.
//!
//! The local cache is an optimization, never the source of truth. Every
//! storage failure (quota, corruption, poisoned lock) is logged and turned
//! into a cache miss or a no-op here so it can never block a save or a read.

use std::sync::Arc;
use tracing::warn;

use super::storage::{CacheStats, CacheStorage, CachedEntity, CachedList};
use super::traits::{QueryKey, Snapshot};

/// Process-wide handle to the local entity and list cache.
pub struct DurableStore<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> DurableStore<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Overwrite the cached copy of an entity.
  pub fn put_entity<T: Snapshot>(&self, entity: &T) {
    if let Err(e) = self.storage.store_entity(entity) {
      warn!(entity = entity.identity(), error = %e, "failed to cache entity");
    }
  }

  pub fn get_entity<T: Snapshot>(&self, id: &str) -> Option<CachedEntity<T>> {
    self.storage.get_entity(id).unwrap_or_else(|e| {
      warn!(entity = id, error = %e, "cached entity unreadable, treating as miss");
      None
    })
  }

  pub fn delete_entity<T: Snapshot>(&self, id: &str) {
    self.delete_entities::<T>(&[id.to_string()]);
  }

  pub fn delete_entities<T: Snapshot>(&self, ids: &[String]) {
    if let Err(e) = self.storage.delete_entities(T::entity_type(), ids) {
      warn!(count = ids.len(), error = %e, "failed to delete cached entities");
    }
  }

  /// Replace the cached list for `key`.
  pub fn put_list<T: Snapshot, K: QueryKey>(&self, key: &K, entities: &[T]) {
    if let Err(e) = self
      .storage
      .store_list(&key.cache_hash(), &key.description(), entities)
    {
      warn!(list = %key.description(), error = %e, "failed to cache list");
    }
  }

  pub fn get_list<T: Snapshot, K: QueryKey>(&self, key: &K) -> Option<CachedList<T>> {
    self
      .storage
      .get_list(&key.cache_hash())
      .unwrap_or_else(|e| {
        warn!(list = %key.description(), error = %e, "cached list unreadable, treating as miss");
        None
      })
  }

  /// Wipe every cached entity and list (logout, schema reset).
  pub fn clear_all(&self) {
    if let Err(e) = self.storage.clear() {
      warn!(error = %e, "failed to clear local cache");
    }
  }

  pub fn stats(&self) -> CacheStats {
    self.storage.stats().unwrap_or_else(|e| {
      warn!(error = %e, "failed to read cache stats");
      CacheStats::default()
    })
  }

  /// Access the backend directly, for callers that want errors reported.
  pub fn storage(&self) -> &S {
    &self.storage
  }
}

impl<S: CacheStorage> Clone for DurableStore<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ListKey, SqliteStorage};
  use crate::testing::Draft;

  fn store() -> DurableStore<SqliteStorage> {
    DurableStore::new(SqliteStorage::open_in_memory().unwrap())
  }

  #[test]
  fn test_entity_roundtrip_and_delete() {
    let store = store();
    store.put_entity(&Draft::new("d-1", "Fox", ""));
    assert!(store.get_entity::<Draft>("d-1").is_some());

    store.delete_entity::<Draft>("d-1");
    assert!(store.get_entity::<Draft>("d-1").is_none());
  }

  #[test]
  fn test_list_roundtrip() {
    let store = store();
    let key = ListKey::OwnedBy {
      owner: "u-1".to_string(),
    };
    store.put_list(&key, &[Draft::new("a", "A", ""), Draft::new("b", "B", "")]);

    let cached = store.get_list::<Draft, _>(&key).unwrap();
    assert_eq!(cached.entities.len(), 2);
  }

  #[test]
  fn test_unreadable_entity_is_a_miss() {
    let store = store();

    // Shares the "draft" namespace but cannot decode a Draft row.
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Other {
      id: String,
      count: u32,
    }
    impl Snapshot for Other {
      fn identity(&self) -> &str {
        &self.id
      }
      fn set_identity(&mut self, id: &str) {
        self.id = id.to_string();
      }
      fn entity_type() -> &'static str {
        "draft"
      }
    }

    store.put_entity(&Draft::new("a", "A", ""));
    assert!(store.get_entity::<Other>("a").is_none());
  }

  #[test]
  fn test_clear_all() {
    let store = store();
    store.put_entity(&Draft::new("a", "A", ""));
    store.clear_all();
    assert_eq!(store.stats(), CacheStats::default());
  }
}
