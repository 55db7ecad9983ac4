use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::CacheTtl;
use crate::connectivity::{ConnectivitySettings, ConnectivityState};
use crate::retry::RetryPolicy;
use crate::store::{Capabilities, PendingCreatesInSearch, StoreOptions};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub connectivity: ConnectivityConfig,
  pub cache: CacheConfig,
  pub retry: RetryConfig,
  pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Endpoints probed for reachability (any one answering means online)
  pub endpoints: Vec<String>,
  pub probe_timeout_secs: u64,
  pub check_interval_secs: u64,
  /// Start in the online state until the first probe says otherwise
  pub assume_online: bool,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    let defaults = ConnectivitySettings::default();
    Self {
      endpoints: defaults.endpoints,
      probe_timeout_secs: defaults.probe_timeout.as_secs(),
      check_interval_secs: defaults.check_interval.as_secs(),
      assume_online: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub online_ttl_secs: u64,
  pub offline_ttl_secs: u64,
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      online_ttl_secs: 5 * 60,
      offline_ttl_secs: 30 * 60,
      sweep_interval_secs: 10 * 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 1000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub collection: String,
  /// Fields matched by offline search (empty = all string fields)
  pub search_fields: Vec<String>,
  /// Fields grouped by offline statistics
  pub stat_fields: Vec<String>,
  pub pending_creates_in_search: PendingCreatesInSearch,
  pub capabilities: Capabilities,
}

impl Default for StoreConfig {
  fn default() -> Self {
    let defaults = StoreOptions::default();
    Self {
      collection: defaults.collection,
      search_fields: defaults.search_fields,
      stat_fields: defaults.stat_fields,
      pending_creates_in_search: defaults.pending_creates_in_search,
      capabilities: defaults.capabilities,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  ///
  /// Without a file, the defaults are used.
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
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file is valid and means "all defaults".
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  fn validate(&self) -> Result<()> {
    if self.connectivity.endpoints.is_empty() {
      return Err(eyre!("connectivity.endpoints must list at least one endpoint"));
    }
    for endpoint in &self.connectivity.endpoints {
      let url = Url::parse(endpoint).map_err(|e| eyre!("Invalid probe endpoint {}: {}", endpoint, e))?;
      if !matches!(url.scheme(), "http" | "https") {
        return Err(eyre!("Probe endpoint {} must use http or https", endpoint));
      }
    }
    if self.retry.max_attempts == 0 {
      return Err(eyre!("retry.max_attempts must be at least 1"));
    }
    if self.cache.sweep_interval_secs == 0 {
      return Err(eyre!("cache.sweep_interval_secs must be greater than zero"));
    }
    Ok(())
  }

  pub fn connectivity_settings(&self) -> ConnectivitySettings {
    let c = &self.connectivity;
    ConnectivitySettings {
      endpoints: c.endpoints.clone(),
      probe_timeout: Duration::from_secs(c.probe_timeout_secs),
      check_interval: Duration::from_secs(c.check_interval_secs),
      initial: if c.assume_online {
        ConnectivityState::Online
      } else {
        ConnectivityState::Offline
      },
    }
  }

  pub fn cache_ttl(&self) -> CacheTtl {
    CacheTtl {
      online: Duration::from_secs(self.cache.online_ttl_secs),
      offline: Duration::from_secs(self.cache.offline_ttl_secs),
    }
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.cache.sweep_interval_secs)
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.retry.max_attempts,
      base_delay: Duration::from_millis(self.retry.base_delay_ms),
    }
  }

  pub fn store_options(&self) -> StoreOptions {
    let s = &self.store;
    StoreOptions {
      collection: s.collection.clone(),
      capabilities: s.capabilities,
      pending_creates_in_search: s.pending_creates_in_search,
      search_fields: s.search_fields.clone(),
      stat_fields: s.stat_fields.clone(),
    }
  }
}
