//! Shared fakes for unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::autosave::Saver;
use crate::cache::Snapshot;
use crate::signed_url::UrlResolver;

/// Canonical identity the fake backend hands out for provisional drafts.
pub const CANONICAL_ID: &str = "CB123456";

/// A creative draft: a name, a prompt and an optional generated image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
  pub id: String,
  pub name: String,
  pub prompt: String,
  #[serde(default)]
  pub image_key: Option<String>,
  #[serde(skip)]
  pub image_url: Option<String>,
}

impl Draft {
  pub fn new(id: &str, name: &str, prompt: &str) -> Self {
    Self {
      id: id.to_string(),
      name: name.to_string(),
      prompt: prompt.to_string(),
      image_key: None,
      image_url: None,
    }
  }

  pub fn with_image(mut self, key: &str) -> Self {
    self.image_key = Some(key.to_string());
    self
  }
}

impl Snapshot for Draft {
  fn identity(&self) -> &str {
    &self.id
  }

  fn set_identity(&mut self, id: &str) {
    self.id = id.to_string();
  }

  fn entity_type() -> &'static str {
    "draft"
  }

  fn is_meaningful(&self) -> bool {
    !self.name.trim().is_empty() || !self.prompt.trim().is_empty()
  }

  fn same_content(&self, baseline: &Self) -> bool {
    // image_url is display-only
    self.id == baseline.id
      && self.name == baseline.name
      && self.prompt == baseline.prompt
      && self.image_key == baseline.image_key
  }

  fn storage_keys(&self) -> Vec<String> {
    self.image_key.iter().cloned().collect()
  }

  fn attach_urls(&mut self, urls: &HashMap<String, String>) {
    if let Some(key) = &self.image_key {
      self.image_url = urls.get(key).cloned();
    }
  }
}

/// Saver that records every call and behaves like a small backend.
#[derive(Default)]
pub struct RecordingSaver {
  calls: Mutex<Vec<Draft>>,
  failures_left: AtomicU32,
  delay: Duration,
  active: AtomicUsize,
  max_active: AtomicUsize,
}

impl RecordingSaver {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every save takes this long to settle.
  pub fn with_delay(delay: Duration) -> Self {
    Self {
      delay,
      ..Self::default()
    }
  }

  /// Reject the next `n` saves.
  pub fn fail_next(&self, n: u32) {
    self.failures_left.store(n, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<Draft> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Highest number of saves observed in flight at once.
  pub fn max_concurrent(&self) -> usize {
    self.max_active.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Saver<Draft> for RecordingSaver {
  async fn save(&self, snapshot: Draft) -> Result<Draft> {
    let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
    self.max_active.fetch_max(active, Ordering::SeqCst);
    self.calls.lock().unwrap().push(snapshot.clone());

    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    self.active.fetch_sub(1, Ordering::SeqCst);

    let failing = self
      .failures_left
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if failing {
      return Err(eyre!("backend rejected save"));
    }

    let mut saved = snapshot;
    if saved.id.starts_with("temp-") {
      saved.id = CANONICAL_ID.to_string();
    }
    Ok(saved)
  }
}

/// URL resolver that signs keys with an increasing counter.
#[derive(Default)]
pub struct CountingResolver {
  single_calls: AtomicUsize,
  batch_calls: Mutex<Vec<Vec<String>>>,
  issued: AtomicUsize,
  failing: AtomicBool,
  delay: Duration,
}

impl CountingResolver {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_delay(delay: Duration) -> Self {
    Self {
      delay,
      ..Self::default()
    }
  }

  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  pub fn single_calls(&self) -> usize {
    self.single_calls.load(Ordering::SeqCst)
  }

  pub fn batch_calls(&self) -> Vec<Vec<String>> {
    self.batch_calls.lock().unwrap().clone()
  }

  fn sign(&self, key: &str) -> String {
    let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
    format!("https://cdn.test/{}?sig={}", key, n)
  }
}

#[async_trait]
impl UrlResolver for CountingResolver {
  async fn resolve(&self, key: &str) -> Result<String> {
    self.single_calls.fetch_add(1, Ordering::SeqCst);
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if self.failing.load(Ordering::SeqCst) {
      return Err(eyre!("storage unavailable"));
    }
    Ok(self.sign(key))
  }

  async fn resolve_batch(&self, keys: &[String]) -> Result<HashMap<String, String>> {
    self.batch_calls.lock().unwrap().push(keys.to_vec());
    if !self.delay.is_zero() {
      tokio::time::sleep(self.delay).await;
    }
    if self.failing.load(Ordering::SeqCst) {
      return Err(eyre!("storage unavailable"));
    }
    Ok(keys.iter().map(|k| (k.clone(), self.sign(k))).collect())
  }
}
