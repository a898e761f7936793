//! Cache of short-lived signed download URLs.
//!
//! Storage objects are only readable through signed URLs. Re-signing the same
//! key on every render wastes a round-trip and defeats HTTP caching, because a
//! new URL is a new cache key even for identical bytes. This cache hands back
//! the same URL for a key until its recorded expiry.

use async_trait::async_trait;
use color_eyre::Result;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SignedUrlConfig;

/// Backend that signs storage keys.
#[async_trait]
pub trait UrlResolver: Send + Sync {
  /// Sign a single key.
  async fn resolve(&self, key: &str) -> Result<String>;

  /// Sign many keys in one round-trip. Keys missing from the result are
  /// treated as unavailable.
  async fn resolve_batch(&self, keys: &[String]) -> Result<HashMap<String, String>>;
}

type PendingUrl = Shared<BoxFuture<'static, Option<String>>>;
type PendingBatch = Shared<BoxFuture<'static, Arc<HashMap<String, String>>>>;

struct CachedUrl {
  url: String,
  expires_at: Instant,
}

#[derive(Default)]
struct State {
  entries: HashMap<String, CachedUrl>,
  /// Resolutions currently running, shared by every caller of the same key
  in_flight: HashMap<String, PendingUrl>,
  /// Bumped by `clear`; resolutions started earlier must not write back
  generation: u64,
}

impl State {
  fn lookup(&mut self, key: &str) -> Option<String> {
    match self.entries.get(key) {
      Some(entry) if Instant::now() < entry.expires_at => Some(entry.url.clone()),
      Some(_) => {
        self.entries.remove(key);
        None
      }
      None => None,
    }
  }

  /// Drop every expired entry, including keys nobody asks for again.
  fn prune(&mut self) {
    let now = Instant::now();
    self.entries.retain(|_, entry| now < entry.expires_at);
  }

  fn insert(&mut self, key: &str, url: String, ttl: Duration) {
    self.entries.insert(
      key.to_string(),
      CachedUrl {
        url,
        expires_at: Instant::now() + ttl,
      },
    );
  }
}

struct Inner {
  resolver: Arc<dyn UrlResolver>,
  cache_duration: Duration,
  state: Mutex<State>,
}

impl Inner {
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Session-scoped signed URL cache. Clones share the same entries.
#[derive(Clone)]
pub struct SignedUrlCache {
  inner: Arc<Inner>,
}

impl SignedUrlCache {
  /// `cache_duration` must be shorter than the lifetime of the URLs the
  /// resolver issues; `from_config` checks this.
  pub fn new(resolver: Arc<dyn UrlResolver>, cache_duration: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        resolver,
        cache_duration,
        state: Mutex::new(State::default()),
      }),
    }
  }

  pub fn from_config(resolver: Arc<dyn UrlResolver>, config: &SignedUrlConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self::new(resolver, config.cache_duration()))
  }

  /// Resolve one key. `None` means the content is not available right now.
  pub async fn resolve(&self, key: &str) -> Option<String> {
    let pending = {
      let mut state = self.inner.lock();
      if let Some(url) = state.lookup(key) {
        return Some(url);
      }
      match state.in_flight.get(key) {
        Some(pending) => pending.clone(),
        None => {
          let pending = self.resolve_one(key.to_string(), state.generation);
          state.in_flight.insert(key.to_string(), pending.clone());
          pending
        }
      }
    };

    pending.await
  }

  /// Resolve many keys with at most one batched backend call.
  ///
  /// Cached keys are answered locally, keys another caller is already
  /// resolving are awaited, and the rest go out together. Unresolvable keys
  /// are absent from the result.
  pub async fn resolve_batch(&self, keys: &[String]) -> HashMap<String, String> {
    let mut found = HashMap::new();
    let mut waiting: Vec<(String, PendingUrl)> = Vec::new();

    {
      let mut state = self.inner.lock();
      let mut seen = HashSet::new();
      let mut missing = Vec::new();

      for key in keys {
        if !seen.insert(key.as_str()) {
          continue;
        }
        if let Some(url) = state.lookup(key) {
          found.insert(key.clone(), url);
        } else if let Some(pending) = state.in_flight.get(key) {
          waiting.push((key.clone(), pending.clone()));
        } else {
          missing.push(key.clone());
        }
      }

      if !missing.is_empty() {
        debug!(
          hits = found.len(),
          misses = missing.len(),
          "resolving signed URL batch"
        );
        let batch = self.resolve_many(missing.clone(), state.generation);
        for key in missing {
          let lookup_key = key.clone();
          let pending: PendingUrl = batch
            .clone()
            .map(move |urls| urls.get(&lookup_key).cloned())
            .boxed()
            .shared();
          state.in_flight.insert(key.clone(), pending.clone());
          waiting.push((key, pending));
        }
      }
    }

    let resolved = join_all(
      waiting
        .into_iter()
        .map(|(key, pending)| async move { (key, pending.await) }),
    )
    .await;

    for (key, url) in resolved {
      if let Some(url) = url {
        found.insert(key, url);
      }
    }
    found
  }

  /// URLs already cached for `keys`. Never contacts the resolver.
  pub fn cached(&self, keys: &[String]) -> HashMap<String, String> {
    let mut state = self.inner.lock();
    keys
      .iter()
      .filter_map(|key| state.lookup(key).map(|url| (key.clone(), url)))
      .collect()
  }

  /// Forget one key so the next resolve signs it again.
  pub fn invalidate(&self, key: &str) {
    self.inner.lock().entries.remove(key);
  }

  /// Drop every cached URL (logout). Resolutions still running finish for
  /// their callers but are not cached.
  pub fn clear(&self) {
    let mut state = self.inner.lock();
    state.entries.clear();
    state.in_flight.clear();
    state.generation += 1;
  }

  /// Number of unexpired cached URLs.
  pub fn len(&self) -> usize {
    let now = Instant::now();
    self
      .inner
      .lock()
      .entries
      .values()
      .filter(|entry| now < entry.expires_at)
      .count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn resolve_one(&self, key: String, generation: u64) -> PendingUrl {
    let inner = Arc::clone(&self.inner);
    async move {
      let url = match inner.resolver.resolve(&key).await {
        Ok(url) if !url.is_empty() => Some(url),
        Ok(_) => {
          warn!(key = %key, "resolver returned an empty URL");
          None
        }
        Err(e) => {
          warn!(key = %key, error = %e, "failed to resolve signed URL");
          None
        }
      };

      let mut state = inner.lock();
      if state.generation == generation {
        state.prune();
        if let Some(url) = &url {
          state.insert(&key, url.clone(), inner.cache_duration);
        }
        state.in_flight.remove(&key);
      }
      url
    }
    .boxed()
    .shared()
  }

  fn resolve_many(&self, keys: Vec<String>, generation: u64) -> PendingBatch {
    let inner = Arc::clone(&self.inner);
    async move {
      let urls = match inner.resolver.resolve_batch(&keys).await {
        Ok(urls) => urls,
        Err(e) => {
          warn!(count = keys.len(), error = %e, "failed to resolve signed URL batch");
          HashMap::new()
        }
      };

      let requested: HashSet<&String> = keys.iter().collect();
      let urls: HashMap<String, String> = urls
        .into_iter()
        .filter(|(key, url)| !url.is_empty() && requested.contains(key))
        .collect();

      let mut state = inner.lock();
      if state.generation == generation {
        state.prune();
        for (key, url) in &urls {
          state.insert(key, url.clone(), inner.cache_duration);
        }
        for key in &keys {
          state.in_flight.remove(key);
        }
      }
      drop(state);

      Arc::new(urls)
    }
    .boxed()
    .shared()
  }
}
