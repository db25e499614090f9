use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub cache: CacheConfig,
  pub docstore: DocstoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Version label of the cache generation. Bumping this forces a fresh
  /// precache on the next refresh; any entry change requires a bump.
  pub version: String,
  /// App-shell URLs precached at install time
  pub precache: Vec<String>,
  /// Cache database path (defaults to the platform data dir)
  pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocstoreConfig {
  /// Base URL of the remote document store
  pub url: String,
  /// Collection holding per-user documents
  #[serde(default = "default_collection")]
  pub collection: String,
}

fn default_collection() -> String {
  "users".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./liftlog.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/liftlog/config.yaml
  /// 4. ~/.config/liftlog/config.yaml
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
        "No configuration file found. Create one at ~/.config/liftlog/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("liftlog.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("liftlog").join("config.yaml");
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
}

impl CacheConfig {
  /// Validated precache manifest.
  pub fn precache_urls(&self) -> Result<Vec<Url>> {
    self
      .precache
      .iter()
      .map(|u| Url::parse(u).map_err(|e| eyre!("Invalid precache URL {}: {}", u, e)))
      .collect()
  }
}

impl DocstoreConfig {
  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.url).map_err(|e| eyre!("Invalid document store URL {}: {}", self.url, e))
  }
}
