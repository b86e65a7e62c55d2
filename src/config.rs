use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the EchoDeed server all app paths resolve against
  pub origin: String,
  pub cache: CacheConfig,
  /// Assets pre-cached at install, as app paths
  pub manifest: Vec<String>,
  /// Page served for offline navigations; must also appear in `manifest`
  pub offline_document: String,
  /// Path prefixes handled by the API strategy
  pub api_prefixes: Vec<String>,
  pub sync: SyncConfig,
  pub notifications: NotificationConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:5000".to_string(),
      cache: CacheConfig::default(),
      manifest: vec![
        "/".to_string(),
        "/offline.html".to_string(),
        "/manifest.json".to_string(),
        "/icon-192.png".to_string(),
        "/icon-512.png".to_string(),
      ],
      offline_document: "/offline.html".to_string(),
      api_prefixes: vec![
        "/api/kindness-posts".to_string(),
        "/api/dashboard".to_string(),
        "/api/certificates".to_string(),
      ],
      sync: SyncConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaticStrategy {
  /// Serve from cache, fall back to the network without storing
  #[default]
  CacheFirst,
  /// Try the network, store 200s, fall back to the cache
  NetworkFirst,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub prefix: String,
  /// Bump whenever the manifest changes so old partitions get evicted
  pub version: String,
  pub static_strategy: StaticStrategy,
  /// SQLite database path (defaults to the data directory)
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "echodeed".to_string(),
      version: "v1".to_string(),
      static_strategy: StaticStrategy::default(),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Sync tag that triggers a queue drain
  pub tag: String,
  /// Endpoint kindness posts are replayed to
  pub replay_endpoint: String,
  /// Reject new entries once this many are pending (unbounded if unset)
  pub max_entries: Option<usize>,
  /// Dead-letter an entry after this many failed replays (unbounded if unset)
  pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "kindness-sync".to_string(),
      replay_endpoint: "/api/kindness-posts".to_string(),
      max_entries: None,
      max_attempts: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  /// Body used when a push arrives without a payload
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  /// Deep link opened by the `explore` action
  pub explore_url: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "EchoDeed".to_string(),
      default_body: "New acts of kindness are waiting for you!".to_string(),
      icon: "/icon-192.png".to_string(),
      badge: "/icon-192.png".to_string(),
      explore_url: "/?tab=feed".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./echodeed-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/echodeed-sw/config.yaml
  ///
  /// Built-in defaults are used when no file is found. `ECHODEED_ORIGIN`
  /// overrides the origin from any source.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };

    if let Some(origin) = Self::origin_from_env() {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("echodeed-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("echodeed-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  fn origin_from_env() -> Option<String> {
    std::env::var("ECHODEED_ORIGIN")
      .ok()
      .filter(|v| !v.trim().is_empty())
  }

  /// Reject configurations the agent cannot run with.
  pub fn validate(&self) -> Result<()> {
    self.origin_url()?;

    if self.cache.prefix.is_empty() || self.cache.version.is_empty() {
      return Err(eyre!("cache.prefix and cache.version must not be empty"));
    }
    if !self.manifest.contains(&self.offline_document) {
      return Err(eyre!(
        "offline_document {} must be listed in the manifest",
        self.offline_document
      ));
    }
    if let Some(bad) = self.api_prefixes.iter().find(|p| !p.starts_with('/')) {
      return Err(eyre!("API prefix {} must start with '/'", bad));
    }
    if self.sync.max_attempts == Some(0) {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }

    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Default database path inside the data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.cache.database {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("cache.db"))
  }
}

/// Directory for the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("echodeed-sw"))
}
