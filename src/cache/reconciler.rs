//! Read reconciler: layers cache-first and network-only reads over the local
//! store and the network.

use chrono::{Duration, Utc};
use color_eyre::Result;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::durable::DurableStore;
use super::storage::CacheStorage;
use super::traits::{CacheResult, QueryKey, Snapshot};
use crate::signed_url::SignedUrlCache;

/// How a read trades freshness for latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
  /// Deliver the cached copy right away (even if stale), then the network copy.
  CacheFirst,
  /// Always go to the network; fall back to the cached copy if that fails.
  NetworkOnly,
}

/// Ordered deliveries for one read: at most a cached copy followed by a
/// network copy. Ends without any delivery when nothing could be loaded.
pub struct Reads<T> {
  rx: mpsc::UnboundedReceiver<CacheResult<T>>,
}

impl<T> Reads<T> {
  /// Next delivery, or `None` once the read is finished.
  pub async fn next(&mut self) -> Option<CacheResult<T>> {
    self.rx.recv().await
  }

  /// Wait for the read to finish and keep only the freshest delivery.
  pub async fn latest(mut self) -> Option<CacheResult<T>> {
    let mut latest = None;
    while let Some(result) = self.rx.recv().await {
      latest = Some(result);
    }
    latest
  }
}

/// Reads entities and lists through the local store, refreshing it from the
/// network and hydrating storage keys into signed URLs on every delivery.
pub struct Reconciler<S: CacheStorage> {
  store: DurableStore<S>,
  urls: Option<SignedUrlCache>,
  /// How long before cached data is labelled stale
  stale_time: Duration,
}

impl<S: CacheStorage + 'static> Reconciler<S> {
  pub fn new(store: DurableStore<S>) -> Self {
    Self {
      store,
      urls: None,
      stale_time: Duration::minutes(5),
    }
  }

  /// Resolve storage keys through this cache when hydrating.
  pub fn with_urls(mut self, urls: SignedUrlCache) -> Self {
    self.urls = Some(urls);
    self
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn store(&self) -> &DurableStore<S> {
    &self.store
  }

  /// Check if cached data is stale based on cached_at timestamp.
  fn is_stale(&self, cached_at: chrono::DateTime<Utc>) -> bool {
    Utc::now() - cached_at > self.stale_time
  }

  /// Read one entity.
  pub fn fetch_one<T, F, Fut>(&self, id: &str, policy: ReadPolicy, fetcher: F) -> Reads<T>
  where
    T: Snapshot,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let this = self.clone();
    let id = id.to_string();
    tokio::spawn(async move { this.reconcile_one(id, policy, fetcher, tx).await });
    Reads { rx }
  }

  /// Read a list. The cached list is always replaced wholesale.
  pub fn fetch_list<T, K, F, Fut>(&self, key: K, policy: ReadPolicy, fetcher: F) -> Reads<Vec<T>>
  where
    T: Snapshot,
    K: QueryKey + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let this = self.clone();
    tokio::spawn(async move { this.reconcile_list(key, policy, fetcher, tx).await });
    Reads { rx }
  }

  /// Drop an entity from the local store after an explicit delete.
  pub fn forget<T: Snapshot>(&self, id: &str) {
    self.store.delete_entity::<T>(id);
  }

  async fn reconcile_one<T, F, Fut>(
    self,
    id: String,
    policy: ReadPolicy,
    fetcher: F,
    tx: mpsc::UnboundedSender<CacheResult<T>>,
  ) where
    T: Snapshot,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let cached = self.store.get_entity::<T>(&id);

    // Sent before the network is touched
    if let (ReadPolicy::CacheFirst, Some(cached)) = (policy, &cached) {
      let mut entity = cached.entity.clone();
      self.attach_cached_urls(std::slice::from_mut(&mut entity));
      let stale = self.is_stale(cached.cached_at);
      let _ = tx.send(CacheResult::from_cache(entity, cached.cached_at, stale));
    }

    let fetched = fetcher().await;

    match fetched {
      Ok(fresh) => {
        self.store.put_entity(&fresh);
        let fresh = self.hydrate_one(fresh).await;
        let _ = tx.send(CacheResult::from_network(fresh));
      }
      Err(e) => match cached {
        Some(cached) if policy == ReadPolicy::NetworkOnly => {
          warn!(entity = %id, error = %e, "fetch failed, serving cached copy");
          let mut entity = cached.entity;
          self.attach_cached_urls(std::slice::from_mut(&mut entity));
          let _ = tx.send(CacheResult::offline(entity, cached.cached_at));
        }
        Some(_) => warn!(entity = %id, error = %e, "refresh failed, keeping cached copy"),
        None => warn!(entity = %id, error = %e, "fetch failed and nothing is cached"),
      },
    }
  }

  async fn reconcile_list<T, K, F, Fut>(
    self,
    key: K,
    policy: ReadPolicy,
    fetcher: F,
    tx: mpsc::UnboundedSender<CacheResult<Vec<T>>>,
  ) where
    T: Snapshot,
    K: QueryKey,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<T>>>,
  {
    let cached = self.store.get_list::<T, K>(&key);

    if let (ReadPolicy::CacheFirst, Some(cached)) = (policy, &cached) {
      let mut entities = cached.entities.clone();
      self.attach_cached_urls(&mut entities);
      let stale = self.is_stale(cached.cached_at);
      let _ = tx.send(CacheResult::from_cache(entities, cached.cached_at, stale));
    }

    let fetched = fetcher().await;

    match fetched {
      Ok(fresh) => {
        debug!(list = %key.description(), count = fresh.len(), "list refreshed");
        self.store.put_list(&key, &fresh);
        let fresh = self.hydrate(fresh).await;
        let _ = tx.send(CacheResult::from_network(fresh));
      }
      Err(e) => match cached {
        Some(cached) if policy == ReadPolicy::NetworkOnly => {
          warn!(list = %key.description(), error = %e, "fetch failed, serving cached list");
          let mut entities = cached.entities;
          self.attach_cached_urls(&mut entities);
          let _ = tx.send(CacheResult::offline(entities, cached.cached_at));
        }
        Some(_) => {
          warn!(list = %key.description(), error = %e, "refresh failed, keeping cached list")
        }
        None => warn!(list = %key.description(), error = %e, "fetch failed and nothing is cached"),
      },
    }
  }

  /// Cached deliveries only use URLs that are already signed; they never
  /// wait on the URL backend.
  fn attach_cached_urls<T: Snapshot>(&self, entities: &mut [T]) {
    let Some(urls) = &self.urls else {
      return;
    };
    let keys: Vec<String> = entities.iter().flat_map(|e| e.storage_keys()).collect();
    if keys.is_empty() {
      return;
    }

    let resolved = urls.cached(&keys);
    for entity in entities.iter_mut() {
      entity.attach_urls(&resolved);
    }
  }

  async fn hydrate_one<T: Snapshot>(&self, mut entity: T) -> T {
    let keys = entity.storage_keys();
    if !keys.is_empty() {
      let urls = self.resolve_urls(&keys).await;
      entity.attach_urls(&urls);
    }
    entity
  }

  async fn hydrate<T: Snapshot>(&self, mut entities: Vec<T>) -> Vec<T> {
    let keys: Vec<String> = entities.iter().flat_map(|e| e.storage_keys()).collect();
    if keys.is_empty() {
      return entities;
    }

    let urls = self.resolve_urls(&keys).await;
    for entity in &mut entities {
      entity.attach_urls(&urls);
    }
    entities
  }

  /// Missing URLs simply stay absent; callers render a placeholder.
  async fn resolve_urls(&self, keys: &[String]) -> HashMap<String, String> {
    let Some(urls) = &self.urls else {
      return HashMap::new();
    };

    match keys {
      [key] => urls
        .resolve(key)
        .await
        .map(|url| HashMap::from([(key.clone(), url)]))
        .unwrap_or_default(),
      _ => urls.resolve_batch(keys).await,
    }
  }
}

impl<S: CacheStorage> Clone for Reconciler<S> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      urls: self.urls.clone(),
      stale_time: self.stale_time,
    }
  }
}
