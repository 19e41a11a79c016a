use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::PartitionSet;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the shelf backend
  pub upstream: String,
  /// Address the offline proxy listens on
  pub listen: String,
  pub cache: CacheConfig,
  pub filters: FilterConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      upstream: "http://127.0.0.1:8000".to_string(),
      listen: "127.0.0.1:8080".to_string(),
      cache: CacheConfig::default(),
      filters: FilterConfig::default(),
      log: LogConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version tag embedded in every partition name; bump it on deploy
  pub version: String,
  /// Prefix of every partition name
  pub prefix: String,
  /// Maximum entries in the dynamic (navigation) partition
  pub dynamic_limit: usize,
  /// Maximum entries in the image partition
  pub image_limit: usize,
  /// Cache cross-origin images (network-first with fallback)
  pub cache_images: bool,
  /// Requests under this prefix are never cached
  pub api_prefix: String,
  /// Requests under this prefix are served cache-first
  pub static_prefix: String,
  /// Fallback page served when a navigation has nothing cached
  pub offline_path: String,
  /// Paths fetched and stored at install time; install fails if any is unreachable
  pub precache: Vec<String>,
  /// Transport timeout for upstream requests, in seconds
  pub timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      prefix: "shelf".to_string(),
      dynamic_limit: 50,
      image_limit: 100,
      cache_images: true,
      api_prefix: "/api/".to_string(),
      static_prefix: "/static/".to_string(),
      offline_path: "/offline".to_string(),
      precache: [
        "/",
        "/offline",
        "/static/css/app.css",
        "/static/js/app.js",
        "/static/manifest.json",
        "/static/icons/icon-192.png",
        "/static/icons/icon-512.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      timeout_secs: 15,
    }
  }
}

impl CacheConfig {
  /// Partition names and limits for this version.
  pub fn partition_set(&self) -> PartitionSet {
    let image_limit = self.cache_images.then_some(self.image_limit);
    PartitionSet::new(&self.prefix, &self.version, self.dynamic_limit, image_limit)
  }

  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
  /// Path of the catalogue (list/filter) view
  pub catalogue_path: String,
  /// Returned when nothing usable is persisted
  pub default_route: String,
  /// Query parameters used by the partial-update transport; never persisted
  pub internal_params: Vec<String>,
}

impl Default for FilterConfig {
  fn default() -> Self {
    Self {
      catalogue_path: "/catalogue".to_string(),
      default_route: "/catalogue".to_string(),
      internal_params: vec!["partial".to_string(), "grid_only".to_string()],
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Also write daily-rotated log files into this directory
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shelf-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shelf-offline/config.yaml
  ///
  /// Falls back to defaults when no file exists. `SHELF_UPSTREAM` overrides the upstream.
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
      None => Self::default(),
    };

    if let Ok(upstream) = std::env::var("SHELF_UPSTREAM") {
      config.upstream = upstream;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shelf-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shelf-offline").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// The upstream URL, which is also the origin the controller treats as same-origin.
  pub fn upstream_url(&self) -> Result<Url> {
    Url::parse(&self.upstream).map_err(|e| eyre!("Invalid upstream URL {}: {}", self.upstream, e))
  }

  pub fn listen_addr(&self) -> Result<SocketAddr> {
    self
      .listen
      .parse()
      .map_err(|e| eyre!("Invalid listen address {}: {}", self.listen, e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_file_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.upstream, "http://127.0.0.1:8000");
    assert_eq!(config.cache.version, "v1");
    assert_eq!(config.cache.dynamic_limit, 50);
    assert!(config.cache.precache.contains(&"/offline".to_string()));
    assert_eq!(config.filters.internal_params, vec!["partial", "grid_only"]);
  }

  #[test]
  fn test_partial_sections() {
    let yaml = r#"
upstream: https://shelf.example.com
cache:
  version: v7
  cache_images: false
filters:
  catalogue_path: /library
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.upstream_url().unwrap().host_str(), Some("shelf.example.com"));
    assert_eq!(config.cache.version, "v7");
    assert_eq!(config.cache.api_prefix, "/api/");
    assert_eq!(config.filters.catalogue_path, "/library");
    assert_eq!(config.filters.default_route, "/catalogue");

    let set = config.cache.partition_set();
    assert_eq!(set.kinds().len(), 2);
    assert!(set.is_current("shelf-static-v7"));
  }

  #[test]
  fn test_section_field_defaults() {
    let config = Config::parse("cache:\n  dynamic_limit: 20\n").unwrap();
    assert_eq!(config.cache.dynamic_limit, 20);
    assert_eq!(config.cache.image_limit, 100);
    assert_eq!(config.cache.offline_path, "/offline");
    assert_eq!(config.cache.timeout_secs, 15);
  }

  #[test]
  fn test_invalid_listen_addr() {
    let config = Config {
      listen: "not an address".to_string(),
      ..Config::default()
    };
    assert!(config.listen_addr().is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
