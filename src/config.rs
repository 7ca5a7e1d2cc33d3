use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache_service::DEFAULT_STALE_MINUTES;
use crate::list::DEFAULT_PAGE_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// Signed-in user for status operations; may be overridden with --user
  pub user_id: Option<String>,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Project base URL, e.g. https://xyz.supabase.co
  pub url: String,
  /// Request timeout; the HTTP client default applies when unset
  pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_page_size")]
  pub page_size: usize,
  /// Age after which the catalog cache is refreshed
  #[serde(default = "default_stale_minutes")]
  pub stale_minutes: i64,
  /// SQLite file; defaults to the platform data directory
  pub database: Option<PathBuf>,
}

fn default_page_size() -> usize {
  DEFAULT_PAGE_SIZE
}

fn default_stale_minutes() -> i64 {
  DEFAULT_STALE_MINUTES
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      page_size: default_page_size(),
      stale_minutes: default_stale_minutes(),
      database: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./scentshelf.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/scentshelf/config.yaml
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
        "No configuration file found. Create one at ~/.config/scentshelf/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("scentshelf.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("scentshelf").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.cache.page_size == 0 {
      return Err(eyre!("cache.page_size must be at least 1"));
    }
    if config.cache.stale_minutes < 0 {
      return Err(eyre!("cache.stale_minutes must not be negative"));
    }
    Ok(config)
  }

  /// Get the remote API key from environment variables.
  ///
  /// Checks SCENTSHELF_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("SCENTSHELF_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set SCENTSHELF_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}
