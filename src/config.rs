use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::QueryKey;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  pub default_project: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Backend base URL, e.g. "http://localhost:8000"
  pub url: String,
  /// Bearer token; the environment takes precedence (see [`Config::api_token`])
  pub token: Option<String>,
  #[serde(
    default = "default_timeout",
    rename = "timeout_ms",
    deserialize_with = "deserialize_millis"
  )]
  pub timeout: Duration,
}

/// Cache behaviour knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// How long fetched data counts as fresh. Zero means always stale.
  #[serde(default, rename = "stale_after_ms", deserialize_with = "deserialize_millis")]
  pub stale_after: Duration,
  /// How long an unobserved entry survives before garbage collection
  #[serde(
    default = "default_gc_grace",
    rename = "gc_grace_ms",
    deserialize_with = "deserialize_millis"
  )]
  pub gc_grace: Duration,
  #[serde(
    default = "default_gc_interval",
    rename = "gc_interval_ms",
    deserialize_with = "deserialize_millis"
  )]
  pub gc_interval: Duration,
  /// Show the previous key's data as a placeholder while a new key loads
  #[serde(default)]
  pub keep_previous_data: bool,
  /// Refetch stale data when an observer mounts
  #[serde(default = "default_true")]
  pub refetch_on_subscribe: bool,
  /// Per-key freshness; the longest matching prefix wins
  #[serde(default)]
  pub stale_overrides: Vec<StaleOverride>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaleOverride {
  #[serde(deserialize_with = "deserialize_key")]
  pub prefix: QueryKey,
  #[serde(rename = "stale_after_ms", deserialize_with = "deserialize_millis")]
  pub stale_after: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      stale_after: Duration::ZERO,
      gc_grace: default_gc_grace(),
      gc_interval: default_gc_interval(),
      keep_previous_data: false,
      refetch_on_subscribe: true,
      stale_overrides: Vec::new(),
    }
  }
}

impl CacheConfig {
  /// Resolve the freshness window for `key`.
  pub fn stale_after_for(&self, key: &QueryKey) -> Duration {
    self
      .stale_overrides
      .iter()
      .filter(|o| key.starts_with(&o.prefix))
      .max_by_key(|o| o.prefix.len())
      .map(|o| o.stale_after)
      .unwrap_or(self.stale_after)
  }

  pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
    self.stale_after = stale_after;
    self
  }

  pub fn with_override(mut self, prefix: QueryKey, stale_after: Duration) -> Self {
    self.stale_overrides.push(StaleOverride {
      prefix,
      stale_after,
    });
    self
  }
}

fn default_timeout() -> Duration {
  Duration::from_secs(30)
}

fn default_gc_grace() -> Duration {
  Duration::from_secs(5 * 60)
}

fn default_gc_interval() -> Duration {
  Duration::from_secs(60)
}

fn default_true() -> bool {
  true
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let ms = u64::deserialize(deserializer)?;
  Ok(Duration::from_millis(ms))
}

fn deserialize_key<'de, D>(deserializer: D) -> Result<QueryKey, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<Value> = Vec::deserialize(deserializer)?;
  Ok(QueryKey::from_json_array(&v))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./query-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/query-sync/config.yaml
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
        "No configuration file found. Create one at ~/.config/query-sync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("query-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("query-sync").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API token.
  ///
  /// Checks QUERY_SYNC_TOKEN first, then API_TOKEN, then the config file.
  pub fn api_token(&self) -> Option<String> {
    std::env::var("QUERY_SYNC_TOKEN")
      .or_else(|_| std::env::var("API_TOKEN"))
      .ok()
      .or_else(|| self.api.token.clone())
  }
}
