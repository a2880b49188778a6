use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that relative paths (manifest entries, endpoints) resolve against
  pub origin: String,
  /// Name shown in notification defaults
  pub app_name: String,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  pub sync: SyncConfig,
  pub retry: RetryConfig,
  pub network: NetworkConfig,
  /// How the newly activated instance treats already-open clients
  pub claim: ClaimMode,
  /// Where cache.db, offline.db and logs live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8000".to_string(),
      app_name: "EcoTrack".to_string(),
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      sync: SyncConfig::default(),
      retry: RetryConfig::default(),
      network: NetworkConfig::default(),
      claim: ClaimMode::default(),
      data_dir: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Namespace name prefix, e.g. "ecotrack" -> "ecotrack-static-v1"
  pub prefix: String,
  /// Bumping this supersedes both namespaces on the next activation
  pub version: u32,
  /// Critical assets fetched at install
  pub static_manifest: Vec<String>,
  /// Document served to navigations when offline and uncached
  pub offline_page: String,
  /// Request headers folded into the canonical cache key
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub relevant_headers: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "ecotrack".to_string(),
      version: 1,
      static_manifest: [
        "/",
        "/index.html",
        "/manifest.json",
        "/offline.html",
        "/assets/index.css",
        "/assets/index.js",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      offline_page: "/offline.html".to_string(),
      relevant_headers: Vec::new(),
    }
  }
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Path prefix that marks a request as an API call
  pub api_prefix: String,
  /// API GET paths containing one of these are written through to cache
  pub cache_patterns: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      cache_patterns: vec![
        "/api/v1/activities/".to_string(),
        "/api/v1/social/".to_string(),
        "/api/v1/auth/user/".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Default replay target for queued mutations
  pub activity_endpoint: String,
  /// Hit once per periodic `data-sync` trigger
  pub refresh_endpoint: String,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      activity_endpoint: "/api/v1/activities/".to_string(),
      refresh_endpoint: "/api/v1/social/refresh/".to_string(),
    }
  }
}

/// Longest allowed delay between two replays of one mutation.
pub const MAX_BACKOFF_SECS: u64 = 365 * 24 * 60 * 60;

/// Replay policy for queued mutations. The defaults retry forever with no
/// backoff.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Abandon a mutation once this many replays have failed
  pub max_attempts: Option<u32>,
  /// Base delay for exponential backoff between replays
  pub backoff_base_secs: Option<u64>,
  /// Upper bound for the backoff delay
  pub backoff_max_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Per-request timeout; unset means a hung request hangs its handler
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClaimMode {
  /// Take control of every open client as soon as activation finishes
  #[default]
  Immediate,
  /// Leave already-open clients on the previous instance
  Staged,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-worker.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-worker/config.yaml
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
    let local = PathBuf::from("offline-worker.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-worker").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if !matches!(origin.scheme(), "http" | "https") {
      return Err(eyre!("Origin must be an http(s) URL: {}", self.origin));
    }
    if !self.routes.api_prefix.starts_with('/') {
      return Err(eyre!(
        "routes.api_prefix must start with '/': {}",
        self.routes.api_prefix
      ));
    }
    for (name, value) in [
      ("retry.backoff_base_secs", self.retry.backoff_base_secs),
      ("retry.backoff_max_secs", self.retry.backoff_max_secs),
    ] {
      if value.is_some_and(|secs| secs > MAX_BACKOFF_SECS) {
        return Err(eyre!(
          "{} must not exceed {} seconds",
          name,
          MAX_BACKOFF_SECS
        ));
      }
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path or absolute URL against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }

  /// The registered scope: the origin's root URL.
  pub fn scope(&self) -> Result<Url> {
    self.resolve("/")
  }

  /// Get the data directory, creating nothing.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-worker"))
  }

  /// Get the bearer token captured with queued mutations.
  ///
  /// Checks OFFLINE_WORKER_TOKEN.
  pub fn get_token() -> Option<String> {
    std::env::var("OFFLINE_WORKER_TOKEN").ok()
  }
}
