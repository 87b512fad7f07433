use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub outbox: OutboxConfig,
  #[serde(default)]
  pub bus: BusConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL every request path is joined onto
  pub base_url: String,
  /// Per-request timeout enforced by the HTTP client
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
  15
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long successful reads are served from cache (0 disables caching)
  pub default_ttl_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 30_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
  /// Give up on an item after this many recoverable failures (unset = never)
  pub max_attempts: Option<u32>,
  pub retry_base_ms: u64,
  pub retry_max_ms: u64,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    Self {
      max_attempts: None,
      retry_base_ms: 2_000,
      retry_max_ms: 60_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
  /// Minimum spacing between two update flushes
  pub min_dispatch_interval_ms: u64,
  /// How often to check the store for flushes from other processes
  pub remote_poll_ms: u64,
}

impl Default for BusConfig {
  fn default() -> Self {
    Self {
      min_dispatch_interval_ms: 250,
      remote_poll_ms: 1_000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Database file (default: $XDG_DATA_HOME/edusync/store.db)
  pub path: Option<PathBuf>,
  /// Keep everything in memory for this session only
  pub in_memory: bool,
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }
}

impl BusConfig {
  pub fn min_dispatch_interval(&self) -> Duration {
    Duration::from_millis(self.min_dispatch_interval_ms)
  }

  pub fn remote_poll(&self) -> Duration {
    Duration::from_millis(self.remote_poll_ms)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./edusync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/edusync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/edusync/config.yaml\n\
                 It needs at least `api.base_url`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("edusync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("edusync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API token from environment variables, if any.
  ///
  /// Checks EDUSYNC_API_TOKEN first, then API_TOKEN as fallback.
  pub fn api_token() -> Option<String> {
    std::env::var("EDUSYNC_API_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("api:\n  base_url: https://api.example.edu/v1\n").unwrap();

    assert_eq!(config.api.timeout_secs, 15);
    assert_eq!(config.cache.default_ttl(), Duration::from_secs(30));
    assert_eq!(config.outbox.max_attempts, None);
    assert_eq!(config.bus.min_dispatch_interval(), Duration::from_millis(250));
    assert!(!config.storage.in_memory);
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  base_url: http://localhost:8080
  timeout_secs: 3
cache:
  default_ttl_ms: 0
outbox:
  max_attempts: 5
  retry_base_ms: 100
bus:
  min_dispatch_interval_ms: 50
storage:
  in_memory: true
"#;
    let config = Config::parse(yaml).unwrap();

    assert_eq!(config.api.timeout_secs, 3);
    assert!(config.cache.default_ttl().is_zero());
    assert_eq!(config.outbox.max_attempts, Some(5));
    assert_eq!(config.outbox.retry_base_ms, 100);
    assert_eq!(config.outbox.retry_max_ms, 60_000);
    assert_eq!(config.bus.remote_poll(), Duration::from_secs(1));
    assert!(config.storage.in_memory);
  }

  #[test]
  fn test_missing_api_section_is_an_error() {
    assert!(Config::parse("cache:\n  default_ttl_ms: 5\n").is_err());
  }

  #[test]
  fn test_explicit_missing_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/edusync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("edusync.yaml");
    std::fs::write(&path, "api:\n  base_url: http://localhost:1\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.api.base_url, "http://localhost:1");
  }
}
