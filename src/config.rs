use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use url::Url;

/// Worker configuration: cache identifiers, precache manifest and order queue settings.
///
/// Every field has a default, so an empty file (or no file at all) yields the
/// shipped storefront build.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Origin that relative paths are resolved against
  pub origin: String,
  pub cache: CacheConfig,
  /// Requests whose path starts with this prefix use the API strategy
  pub api_prefix: String,
  /// Page served to HTML requests when both cache and network miss
  pub offline_page: String,
  /// Paths fetched and stored all-or-nothing at install time
  pub manifest: Vec<String>,
  /// Skip the waiting phase right after a successful install
  pub skip_waiting_on_install: bool,
  /// Whether the platform offers deferred task registration
  pub background_sync: bool,
  pub menu_endpoint: String,
  pub order: OrderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub prefix: String,
  pub static_version: String,
  pub api_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
  /// Deferred task name
  pub tag: String,
  pub endpoint: String,
  pub payload: serde_json::Value,
  /// Sent to every open client once the deferred task ran
  pub confirmation: String,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      cache: CacheConfig::default(),
      api_prefix: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      manifest: [
        "/",
        "/index.html",
        "/style.css",
        "/app.js",
        "/coffee.jpg",
        "/manifest.json",
        "/offline.html",
        "/api/menu.json",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      skip_waiting_on_install: true,
      background_sync: true,
      menu_endpoint: "/api/menu.json".to_string(),
      order: OrderConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "aromatna".to_string(),
      static_version: "v2".to_string(),
      api_version: "v2".to_string(),
    }
  }
}

impl Default for OrderConfig {
  fn default() -> Self {
    Self {
      tag: "send-order".to_string(),
      endpoint: "/api/send-order".to_string(),
      payload: serde_json::json!({ "ok": true, "note": "demo order" }),
      confirmation: "Order sent!".to_string(),
    }
  }
}

/// Names of the two partitions the running build considers current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  pub static_name: String,
  pub api_name: String,
}

impl CacheNames {
  pub fn is_current(&self, partition: &str) -> bool {
    partition == self.static_name || partition == self.api_name
  }

  /// Identifier of the build these names belong to, recorded for the active worker.
  pub fn build_tag(&self) -> String {
    format!("{}+{}", self.static_name, self.api_name)
  }
}

impl WorkerConfig {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./aromatna.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/aromatna/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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
      None => {
        debug!("No configuration file found, using defaults");
        Self::default()
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("aromatna.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("aromatna").join("config.yaml");
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
    // An empty document deserializes to unit, not to an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;

    if !self.api_prefix.starts_with('/') {
      return Err(eyre!(
        "api_prefix must be an absolute path, got '{}'",
        self.api_prefix
      ));
    }

    if self.cache.prefix.is_empty() {
      return Err(eyre!("cache.prefix must not be empty"));
    }

    if !self.manifest.iter().any(|p| p == &self.offline_page) {
      warn!(
        offline_page = %self.offline_page,
        "Offline page is not part of the precache manifest"
      );
    }

    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path (or absolute URL) against the configured origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid request path '{}': {}", path, e))
  }

  pub fn cache_names(&self) -> CacheNames {
    CacheNames {
      static_name: format!("{}-static-{}", self.cache.prefix, self.cache.static_version),
      api_name: format!("{}-api-{}", self.cache.prefix, self.cache.api_version),
    }
  }
}

/// Directory for the cache database, the cart file and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("aromatna"))
}
