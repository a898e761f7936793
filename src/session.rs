//! Process-wide services shared by every editor and reader in one session.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::autosave::{AutosaveController, Saver};
use crate::cache::{DurableStore, Reconciler, Snapshot, SqliteStorage};
use crate::config::{CacheConfig, Config};
use crate::signed_url::{SignedUrlCache, UrlResolver};

/// Owns the local store, the signed URL cache and the connectivity signal.
///
/// Created once at startup and torn down with `logout`.
pub struct Session {
  config: Config,
  store: DurableStore<SqliteStorage>,
  urls: SignedUrlCache,
  online: watch::Sender<bool>,
}

impl Session {
  pub fn start(config: Config, resolver: Arc<dyn UrlResolver>) -> Result<Self> {
    config.validate()?;

    let storage = open_storage(&config.cache)?;
    let urls = SignedUrlCache::from_config(resolver, &config.signed_urls)?;
    let (online, _) = watch::channel(true);

    Ok(Self {
      config,
      store: DurableStore::new(storage),
      urls,
      online,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &DurableStore<SqliteStorage> {
    &self.store
  }

  pub fn urls(&self) -> &SignedUrlCache {
    &self.urls
  }

  /// A reader wired to this session's store and URL cache.
  pub fn reconciler(&self) -> Reconciler<SqliteStorage> {
    Reconciler::new(self.store.clone())
      .with_urls(self.urls.clone())
      .with_stale_time(chrono::Duration::seconds(
        self.config.cache.stale_after_secs as i64,
      ))
  }

  /// An autosave controller for one editor, following this session's
  /// connectivity. Call `spawn` on it to start watching a snapshot.
  pub fn autosave<S: Snapshot>(
    &self,
    saver: Arc<dyn Saver<S>>,
  ) -> AutosaveController<S, SqliteStorage> {
    AutosaveController::new(saver, self.store.clone(), self.online.subscribe())
      .with_config(self.config.autosave.clone())
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  /// Record a connectivity change. Repeating the current state is ignored.
  pub fn set_online(&self, online: bool) {
    let changed = self.online.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });

    if changed {
      info!(online, "connectivity changed");
    }
  }

  /// Forget everything cached for the signed-in user.
  pub fn logout(&self) {
    self.store.clear_all();
    self.urls.clear();
    info!("session data cleared");
  }
}

/// Open the local store. A cache file that cannot be used is rebuilt, and if
/// that fails too the session runs on an in-memory store.
fn open_storage(config: &CacheConfig) -> Result<SqliteStorage> {
  if !config.enabled {
    info!("local cache disabled, keeping data in memory for this session");
    return SqliteStorage::open_in_memory();
  }

  let path = config.path.as_deref();
  let e = match SqliteStorage::open(path) {
    Ok(storage) => return Ok(storage),
    Err(e) => e,
  };
  warn!(error = %e, "local cache unreadable, rebuilding it");

  match SqliteStorage::recreate(path) {
    Ok(storage) => Ok(storage),
    Err(e) => {
      warn!(error = %e, "could not rebuild local cache, keeping data in memory");
      SqliteStorage::open_in_memory()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::autosave::SaveStatus;
  use crate::cache::{CacheStats, ReadPolicy};
  use crate::testing::{CountingResolver, Draft, RecordingSaver};
  use std::time::Duration;

  fn session() -> Session {
    let mut config = Config::default();
    config.cache.enabled = false;
    Session::start(config, Arc::new(CountingResolver::new())).unwrap()
  }

  #[test]
  fn test_invalid_config_is_rejected() {
    let mut config = Config::default();
    config.cache.enabled = false;
    config.signed_urls.cache_duration_secs = config.signed_urls.url_ttl_secs;
    assert!(Session::start(config, Arc::new(CountingResolver::new())).is_err());
  }

  fn scratch_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("draftsync-session-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
  }

  fn on_disk(path: std::path::PathBuf) -> Config {
    let mut config = Config::default();
    config.cache.path = Some(path);
    config
  }

  #[test]
  fn test_corrupt_cache_file_is_rebuilt() {
    let path = scratch_dir().join("corrupt.db");
    std::fs::write(&path, vec![0xAB; 4096]).unwrap();

    let session =
      Session::start(on_disk(path.clone()), Arc::new(CountingResolver::new())).unwrap();
    session.store().put_entity(&Draft::new("d-1", "Fox", ""));
    assert!(session.store().get_entity::<Draft>("d-1").is_some());

    drop(session);
    std::fs::remove_file(&path).unwrap();
  }

  #[test]
  fn test_unusable_cache_path_falls_back_to_memory() {
    // A regular file where the cache directory should be
    let blocker = scratch_dir().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();

    let session = Session::start(
      on_disk(blocker.join("cache.db")),
      Arc::new(CountingResolver::new()),
    )
    .unwrap();
    session.store().put_entity(&Draft::new("d-1", "Fox", ""));
    assert!(session.store().get_entity::<Draft>("d-1").is_some());

    std::fs::remove_file(&blocker).unwrap();
  }

  #[tokio::test]
  async fn test_connectivity_publishes_edges_only() {
    let session = session();
    let mut rx = session.online.subscribe();

    session.set_online(true);
    assert!(!rx.has_changed().unwrap());

    session.set_online(false);
    assert!(rx.has_changed().unwrap());
    assert!(!*rx.borrow_and_update());
    assert!(!session.is_online());
  }

  #[tokio::test(start_paused = true)]
  async fn test_autosave_follows_session_connectivity() {
    let session = session();
    let saver = Arc::new(RecordingSaver::new());
    let fox = Draft::new("d-1", "Fox", "");

    session.set_online(false);
    let (handle, _events) = session
      .autosave::<Draft>(saver.clone())
      .spawn(fox.clone(), Some(fox));

    handle.update(Draft::new("d-1", "Fox", "red"));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(handle.status(), SaveStatus::Offline);
    assert_eq!(saver.call_count(), 0);

    session.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(saver.call_count(), 1);
    assert_eq!(handle.status(), SaveStatus::Saved);

    let stored = session.store().get_entity::<Draft>("d-1").unwrap();
    assert_eq!(stored.entity.prompt, "red");
  }

  #[tokio::test]
  async fn test_reconciler_uses_session_urls() {
    let session = session();
    let reads = session.reconciler().fetch_one("d-1", ReadPolicy::NetworkOnly, || async {
      Ok(Draft::new("d-1", "Fox", "").with_image("img/d-1.png"))
    });

    assert!(reads.latest().await.unwrap().data.image_url.is_some());
    assert_eq!(session.urls().len(), 1);
  }

  #[tokio::test]
  async fn test_logout_clears_store_and_urls() {
    let session = session();
    session.store().put_entity(&Draft::new("d-1", "Fox", ""));
    session.urls().resolve("img/d-1.png").await;

    session.logout();

    assert_eq!(session.store().stats(), CacheStats::default());
    assert!(session.urls().is_empty());
  }
}
