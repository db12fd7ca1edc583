use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the application is served from (e.g. "https://order.example.com")
  pub origin: Option<String>,
  /// Version tag embedded in partition names; bump it to roll over all caches
  pub cache_version: String,
  /// Remote data hosts allowed through interception (substring match on host)
  pub remote_hosts: Vec<String>,
  /// URL markers identifying the remote data REST/API surface
  pub api_markers: Vec<String>,
  /// URL markers identifying object-storage (image) downloads
  pub storage_markers: Vec<String>,
  /// Path extensions classified as images (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase")]
  pub image_extensions: Vec<String>,
  /// Root-relative resources pre-cached into the shell partition at install
  pub shell_manifest: Vec<String>,
  /// Root-relative path of the offline fallback document
  pub offline_page: String,
  /// SQLite database path (default: $XDG_DATA_HOME/kiosk-cache/cache.db)
  pub database: Option<PathBuf>,
  pub arbiter: ArbiterConfig,
  pub probe: ProbeConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
  /// How long freshly fetched data counts as fresh
  pub fresh_time_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
  pub interval_secs: u64,
  /// URL probed for connectivity (defaults to the origin)
  pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is not set
  pub level: String,
  /// Write daily-rolling log files here instead of stderr
  pub dir: Option<PathBuf>,
}

fn deserialize_lowercase<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: None,
      cache_version: "v1".to_string(),
      remote_hosts: strings(&["supabase.co"]),
      api_markers: strings(&["/rest/v1/", "/functions/v1/"]),
      storage_markers: strings(&["/storage/v1/object/"]),
      image_extensions: strings(&["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"]),
      shell_manifest: strings(&[
        "/",
        "/index.html",
        "/favicon.ico",
        "/placeholder.svg",
        "/src/main.tsx",
        "/src/index.css",
        "/offline.html",
      ]),
      offline_page: "/offline.html".to_string(),
      database: None,
      arbiter: ArbiterConfig::default(),
      probe: ProbeConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Default for ArbiterConfig {
  fn default() -> Self {
    Self {
      fresh_time_secs: 300,
    }
  }
}

impl Default for ProbeConfig {
  fn default() -> Self {
    Self {
      interval_secs: 15,
      url: None,
    }
  }
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./kiosk-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/kiosk-cache/config.yaml
  ///
  /// Without any file the defaults apply; the origin must then come from the CLI.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("kiosk-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("kiosk-cache").join("config.yaml");
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

  fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// The application origin as a URL.
  pub fn origin_url(&self) -> Result<Url> {
    let origin = self
      .origin
      .as_deref()
      .ok_or_else(|| eyre!("No origin configured. Set `origin` in the config file or pass --origin."))?;
    Url::parse(origin).map_err(|e| eyre!("Invalid origin '{}': {}", origin, e))
  }

  pub fn probe_url(&self) -> Result<Url> {
    match &self.probe.url {
      Some(url) => Url::parse(url).map_err(|e| eyre!("Invalid probe url '{}': {}", url, e)),
      None => self.origin_url(),
    }
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe.interval_secs.max(1))
  }

  pub fn fresh_time(&self) -> Duration {
    Duration::from_secs(self.arbiter.fresh_time_secs)
  }

  /// Get the remote data API key from the environment, if set.
  ///
  /// Checks KIOSK_API_KEY.
  pub fn get_api_key() -> Option<String> {
    std::env::var("KIOSK_API_KEY").ok().filter(|k| !k.is_empty())
  }
}
