//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use super::traits::Snapshot;

/// A cached list snapshot.
#[derive(Debug, Clone)]
pub struct CachedList<T> {
  /// The cached entities in order
  pub entities: Vec<T>,
  /// When the list was cached
  pub cached_at: DateTime<Utc>,
}

/// A single cached entity.
#[derive(Debug, Clone)]
pub struct CachedEntity<T> {
  /// The cached entity
  pub entity: T,
  /// When the entity was cached
  pub cached_at: DateTime<Utc>,
}

/// Counts reported by `cache stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Cached entities per entity type
  pub entities: BTreeMap<String, usize>,
  /// Number of cached lists
  pub lists: usize,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Store (overwrite) a single entity under its identity.
  fn store_entity<T: Snapshot>(&self, entity: &T) -> Result<()>;

  /// Get a single entity by identity.
  fn get_entity<T: Snapshot>(&self, entity_key: &str) -> Result<Option<CachedEntity<T>>>;

  /// Delete entities of one type by identity. Returns how many rows were removed.
  fn delete_entities(&self, entity_type: &str, entity_keys: &[String]) -> Result<usize>;

  /// Store a list snapshot, replacing whatever was cached for `key`.
  fn store_list<T: Snapshot>(&self, key: &str, description: &str, entities: &[T]) -> Result<()>;

  /// Get a cached list snapshot.
  fn get_list<T: Snapshot>(&self, key: &str) -> Result<Option<CachedList<T>>>;

  /// Remove everything.
  fn clear(&self) -> Result<()>;

  /// Entity and list counts.
  fn stats(&self) -> Result<CacheStats>;

  /// Raw JSON of an entity, for inspection without knowing its Rust type.
  fn get_raw(&self, entity_type: &str, entity_key: &str) -> Result<Option<serde_json::Value>>;
}

/// Bumping this drops and rebuilds every cache table on next open.
pub const SCHEMA_VERSION: i64 = 2;

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Delete the database at `path` (or the default location) and open a fresh
  /// one. Used when the existing file cannot be opened at all.
  pub fn recreate(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    for suffix in ["", "-journal", "-wal", "-shm"] {
      let mut file = path.clone().into_os_string();
      file.push(suffix);
      match std::fs::remove_file(&file) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(eyre!("Failed to remove cache file {:?}: {}", file, e)),
      }
    }

    Self::open(Some(&path))
  }

  /// Open a cache that lives only as long as this process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("draftsync").join("cache.db"))
  }

  /// Create the cache tables, rebuilding them from scratch on a version change.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read cache schema version: {}", e))?;

    if version != SCHEMA_VERSION {
      info!(
        from = version,
        to = SCHEMA_VERSION,
        "cache schema changed, rebuilding"
      );
      conn
        .execute_batch(DROP_SCHEMA)
        .map_err(|e| eyre!("Failed to drop cache tables: {}", e))?;
    }

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    conn
      .execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))
      .map_err(|e| eyre!("Failed to record cache schema version: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Tables from every schema version, dropped before a rebuild.
const DROP_SCHEMA: &str = r#"
DROP TABLE IF EXISTS entity_cache;
DROP TABLE IF EXISTS list_cache;
"#;

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Entity namespace (serialized JSON snapshots)
CREATE TABLE IF NOT EXISTS entity_cache (
    entity_type TEXT NOT NULL,
    entity_key TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_key)
);

-- List namespace (whole ordered list stored as one JSON array)
CREATE TABLE IF NOT EXISTS list_cache (
    query_hash TEXT PRIMARY KEY,
    query_description TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    data BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    result_count INTEGER NOT NULL
);
"#;

impl CacheStorage for SqliteStorage {
  fn store_entity<T: Snapshot>(&self, entity: &T) -> Result<()> {
    let conn = self.lock()?;
    let data =
      serde_json::to_vec(entity).map_err(|e| eyre!("Failed to serialize entity: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO entity_cache (entity_type, entity_key, data, cached_at)
         VALUES (?, ?, ?, ?)",
        params![T::entity_type(), entity.identity(), data, now_string()],
      )
      .map_err(|e| eyre!("Failed to store entity: {}", e))?;

    Ok(())
  }

  fn get_entity<T: Snapshot>(&self, entity_key: &str) -> Result<Option<CachedEntity<T>>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM entity_cache
         WHERE entity_type = ? AND entity_key = ?",
        params![T::entity_type(), entity_key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entity {}: {}", entity_key, e))?;

    match row {
      Some((data, cached_at_str)) => {
        let entity: T = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize entity {}: {}", entity_key, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntity { entity, cached_at }))
      }
      None => Ok(None),
    }
  }

  fn delete_entities(&self, entity_type: &str, entity_keys: &[String]) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut removed = 0;
    for key in entity_keys {
      removed += tx
        .execute(
          "DELETE FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
          params![entity_type, key],
        )
        .map_err(|e| eyre!("Failed to delete entity {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed)
  }

  fn store_list<T: Snapshot>(&self, key: &str, description: &str, entities: &[T]) -> Result<()> {
    let conn = self.lock()?;
    let data =
      serde_json::to_vec(entities).map_err(|e| eyre!("Failed to serialize list: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO list_cache
           (query_hash, query_description, entity_type, data, cached_at, result_count)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          key,
          description,
          T::entity_type(),
          data,
          now_string(),
          entities.len()
        ],
      )
      .map_err(|e| eyre!("Failed to store list {}: {}", description, e))?;

    Ok(())
  }

  fn get_list<T: Snapshot>(&self, key: &str) -> Result<Option<CachedList<T>>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, cached_at FROM list_cache
         WHERE query_hash = ? AND entity_type = ?",
        params![key, T::entity_type()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query list: {}", e))?;

    match row {
      Some((data, cached_at_str)) => {
        let entities: Vec<T> =
          serde_json::from_slice(&data).map_err(|e| eyre!("Failed to deserialize list: {}", e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedList {
          entities,
          cached_at,
        }))
      }
      None => Ok(None),
    }
  }

  fn clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch("DELETE FROM entity_cache; DELETE FROM list_cache;")
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }

  fn stats(&self) -> Result<CacheStats> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT entity_type, COUNT(*) FROM entity_cache GROUP BY entity_type")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
    let entities = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
      .map_err(|e| eyre!("Failed to count entities: {}", e))?
      .filter_map(|r| r.ok())
      .map(|(entity_type, count)| (entity_type, count as usize))
      .collect();

    let lists: i64 = conn
      .query_row("SELECT COUNT(*) FROM list_cache", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count lists: {}", e))?;

    Ok(CacheStats {
      entities,
      lists: lists as usize,
    })
  }

  fn get_raw(&self, entity_type: &str, entity_key: &str) -> Result<Option<serde_json::Value>> {
    let conn = self.lock()?;

    let data: Option<Vec<u8>> = conn
      .query_row(
        "SELECT data FROM entity_cache WHERE entity_type = ? AND entity_key = ?",
        params![entity_type, entity_key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query entity {}: {}", entity_key, e))?;

    data
      .map(|bytes| {
        serde_json::from_slice(&bytes)
          .map_err(|e| eyre!("Cached entity {} is not valid JSON: {}", entity_key, e))
      })
      .transpose()
  }
}

fn now_string() -> String {
  Utc::now().to_rfc3339()
}

/// Parse a timestamp written by `now_string`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::Draft;

  fn storage() -> SqliteStorage {
    SqliteStorage::open_in_memory().unwrap()
  }

  #[test]
  fn test_store_and_get_entity() {
    let storage = storage();
    let draft = Draft::new("d-1", "Fox", "a red fox");
    storage.store_entity(&draft).unwrap();

    let cached = storage.get_entity::<Draft>("d-1").unwrap().unwrap();
    assert_eq!(cached.entity, draft);
    assert!(storage.get_entity::<Draft>("d-2").unwrap().is_none());
  }

  #[test]
  fn test_store_entity_overwrites() {
    let storage = storage();
    storage
      .store_entity(&Draft::new("d-1", "Fox", ""))
      .unwrap();
    storage
      .store_entity(&Draft::new("d-1", "Wolf", ""))
      .unwrap();

    let cached = storage.get_entity::<Draft>("d-1").unwrap().unwrap();
    assert_eq!(cached.entity.name, "Wolf");
    assert_eq!(storage.stats().unwrap().entities.get("draft"), Some(&1));
  }

  #[test]
  fn test_delete_entities() {
    let storage = storage();
    for id in ["a", "b", "c"] {
      storage.store_entity(&Draft::new(id, id, "")).unwrap();
    }

    let removed = storage
      .delete_entities("draft", &["a".to_string(), "c".to_string(), "zzz".to_string()])
      .unwrap();
    assert_eq!(removed, 2);
    assert!(storage.get_entity::<Draft>("a").unwrap().is_none());
    assert!(storage.get_entity::<Draft>("b").unwrap().is_some());
  }

  #[test]
  fn test_list_is_replaced_wholesale_and_keeps_order() {
    let storage = storage();
    let first = vec![Draft::new("a", "A", ""), Draft::new("b", "B", "")];
    storage.store_list("mine", "mine", &first).unwrap();

    let second = vec![Draft::new("c", "C", ""), Draft::new("a", "A2", "")];
    storage.store_list("mine", "mine", &second).unwrap();

    let cached = storage.get_list::<Draft>("mine").unwrap().unwrap();
    let ids: Vec<_> = cached.entities.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a"]);
    assert_eq!(cached.entities[1].name, "A2");
  }

  #[test]
  fn test_lists_do_not_touch_entities() {
    let storage = storage();
    storage
      .store_list("mine", "mine", &[Draft::new("a", "A", "")])
      .unwrap();
    assert!(storage.get_entity::<Draft>("a").unwrap().is_none());
  }

  #[test]
  fn test_clear_removes_everything() {
    let storage = storage();
    storage.store_entity(&Draft::new("a", "A", "")).unwrap();
    storage
      .store_list("mine", "mine", &[Draft::new("a", "A", "")])
      .unwrap();

    storage.clear().unwrap();
    assert_eq!(storage.stats().unwrap(), CacheStats::default());
  }

  #[test]
  fn test_get_raw() {
    let storage = storage();
    storage
      .store_entity(&Draft::new("a", "Fox", "").with_image("img/a.png"))
      .unwrap();

    let raw = storage.get_raw("draft", "a").unwrap().unwrap();
    assert_eq!(raw["name"], "Fox");
    assert_eq!(raw["image_key"], "img/a.png");
    assert!(storage.get_raw("character", "a").unwrap().is_none());
  }

  #[test]
  fn test_corrupt_row_is_an_error_not_a_panic() {
    let storage = storage();
    storage
      .lock()
      .unwrap()
      .execute(
        "INSERT INTO entity_cache (entity_type, entity_key, data, cached_at)
         VALUES ('draft', 'bad', X'00FF', ?)",
        params![now_string()],
      )
      .unwrap();

    assert!(storage.get_entity::<Draft>("bad").is_err());
  }

  #[test]
  fn test_schema_version_change_rebuilds_tables() {
    let conn = Connection::open_in_memory().unwrap();
    conn
      .execute_batch(
        "CREATE TABLE entity_cache (legacy TEXT);
         INSERT INTO entity_cache VALUES ('old');
         PRAGMA user_version = 1;",
      )
      .unwrap();

    let storage = SqliteStorage::from_connection(conn).unwrap();
    storage.store_entity(&Draft::new("a", "A", "")).unwrap();
    assert!(storage.get_entity::<Draft>("a").unwrap().is_some());

    let version: i64 = storage
      .lock()
      .unwrap()
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .unwrap();
    assert_eq!(version, SCHEMA_VERSION);
  }

  fn scratch_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("draftsync-storage-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(name)
  }

  #[test]
  fn test_recreate_replaces_garbage_file() {
    let path = scratch_path("garbage.db");
    std::fs::write(&path, vec![0xAB; 4096]).unwrap();
    assert!(SqliteStorage::open(Some(&path)).is_err());

    let storage = SqliteStorage::recreate(Some(&path)).unwrap();
    storage.store_entity(&Draft::new("a", "A", "")).unwrap();
    assert!(storage.get_entity::<Draft>("a").unwrap().is_some());

    drop(storage);
    assert!(SqliteStorage::open(Some(&path)).is_ok());
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn test_same_version_keeps_data() {
    let storage = storage();
    storage.store_entity(&Draft::new("a", "A", "")).unwrap();

    storage.run_migrations().unwrap();
    assert!(storage.get_entity::<Draft>("a").unwrap().is_some());
  }
}
