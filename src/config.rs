use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub autosave: AutosaveConfig,
  pub signed_urls: SignedUrlConfig,
  pub cache: CacheConfig,
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
  /// Quiet period after the last edit before an automatic save
  pub debounce_ms: u64,
  /// A save that has not settled after this long counts as failed
  pub save_timeout_secs: u64,
  pub retry: RetryConfig,
}

impl Default for AutosaveConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 1500,
      save_timeout_secs: 30,
      retry: RetryConfig::default(),
    }
  }
}

impl AutosaveConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn save_timeout(&self) -> Duration {
    Duration::from_secs(self.save_timeout_secs)
  }
}

/// Automatic retry after a rejected save: bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Automatic retries before the error becomes sticky (0 = never retry)
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 2000,
      max_delay_ms: 30_000,
    }
  }
}

impl RetryConfig {
  /// Delay before retrying after `failures` consecutive failures, or `None`
  /// once the attempts are used up.
  pub fn delay_for(&self, failures: u32) -> Option<Duration> {
    if failures == 0 || failures > self.max_attempts {
      return None;
    }
    let factor = 2u64.saturating_pow(failures - 1);
    let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
    Some(Duration::from_millis(delay))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignedUrlConfig {
  /// How long a resolved URL is reused
  pub cache_duration_secs: u64,
  /// Lifetime of the URLs the backend issues; must exceed the cache duration
  pub url_ttl_secs: u64,
}

impl Default for SignedUrlConfig {
  fn default() -> Self {
    Self {
      cache_duration_secs: 3000,
      url_ttl_secs: 3600,
    }
  }
}

impl SignedUrlConfig {
  pub fn cache_duration(&self) -> Duration {
    Duration::from_secs(self.cache_duration_secs)
  }

  /// A cached URL must never outlive the signature behind it.
  pub fn validate(&self) -> Result<()> {
    if self.cache_duration_secs == 0 {
      return Err(eyre!("signed_urls.cache_duration_secs must be positive"));
    }
    if self.cache_duration_secs >= self.url_ttl_secs {
      return Err(eyre!(
        "signed_urls.cache_duration_secs ({}) must be shorter than url_ttl_secs ({})",
        self.cache_duration_secs,
        self.url_ttl_secs
      ));
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false the cache lives in memory for this session only
  pub enabled: bool,
  /// Database location (defaults to the user data directory)
  pub path: Option<PathBuf>,
  /// Cached reads older than this are reported as stale
  pub stale_after_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
      stale_after_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive; RUST_LOG takes precedence
  pub level: String,
  /// Write logs to this file (rotated daily) instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./draftsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/draftsync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("draftsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("draftsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  pub fn validate(&self) -> Result<()> {
    if self.autosave.debounce_ms == 0 {
      return Err(eyre!("autosave.debounce_ms must be positive"));
    }
    if self.autosave.save_timeout_secs == 0 {
      return Err(eyre!("autosave.save_timeout_secs must be positive"));
    }
    self.signed_urls.validate()
  }
}
