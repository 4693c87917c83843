use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub server: ServerConfig,
  /// Directory for the local stores (defaults to $XDG_DATA_HOME/fieldsync)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub tunables: Tunables,
  #[serde(default)]
  pub assets: AssetConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub url: String,
  #[serde(default = "default_health_path")]
  pub health_path: String,
  #[serde(default = "default_teams_path")]
  pub teams_path: String,
  #[serde(default = "default_matches_path")]
  pub matches_path: String,
  #[serde(default = "default_scoring_config_path")]
  pub scoring_config_path: String,
  #[serde(default = "default_form_path")]
  pub form_path: String,
  #[serde(default = "default_save_path")]
  pub save_path: String,
}

impl ServerConfig {
  pub fn with_url(url: &str) -> Self {
    Self {
      url: url.to_string(),
      health_path: default_health_path(),
      teams_path: default_teams_path(),
      matches_path: default_matches_path(),
      scoring_config_path: default_scoring_config_path(),
      form_path: default_form_path(),
      save_path: default_save_path(),
    }
  }
}

fn default_health_path() -> String {
  "/health".to_string()
}

fn default_teams_path() -> String {
  "/scouting/api/teams".to_string()
}

fn default_matches_path() -> String {
  "/scouting/api/matches".to_string()
}

fn default_scoring_config_path() -> String {
  "/scouting/api/config".to_string()
}

fn default_form_path() -> String {
  "/scouting/form".to_string()
}

fn default_save_path() -> String {
  "/scouting/api/save".to_string()
}

/// Longest staleness window accepted from a config file.
const MAX_FRESHNESS_HOURS: i64 = 24 * 365;
/// Longest retention for synced submissions accepted from a config file.
const MAX_RETENTION_DAYS: i64 = 3650;

/// Timing knobs. Everything else about sync behavior is fixed.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tunables {
  pub freshness_hours: i64,
  pub retention_days: i64,
  pub probe_interval_secs: u64,
  pub probe_timeout_ms: u64,
  pub request_timeout_secs: u64,
  pub stale_check_interval_secs: u64,
  pub banner_settle_ms: u64,
}

impl Default for Tunables {
  fn default() -> Self {
    Self {
      freshness_hours: 24,
      retention_days: 7,
      probe_interval_secs: 15,
      probe_timeout_ms: 2500,
      request_timeout_secs: 30,
      stale_check_interval_secs: 300,
      banner_settle_ms: 1000,
    }
  }
}

impl Tunables {
  /// Reject values that would panic a background loop or overflow date math.
  pub fn validate(&self) -> Result<()> {
    let nonzero = [
      ("probe_interval_secs", self.probe_interval_secs),
      ("probe_timeout_ms", self.probe_timeout_ms),
      ("request_timeout_secs", self.request_timeout_secs),
      ("stale_check_interval_secs", self.stale_check_interval_secs),
    ];
    for (name, value) in nonzero {
      if value == 0 {
        return Err(eyre!("tunables.{} must be greater than zero", name));
      }
    }

    if !(1..=MAX_FRESHNESS_HOURS).contains(&self.freshness_hours) {
      return Err(eyre!(
        "tunables.freshness_hours must be between 1 and {}, got {}",
        MAX_FRESHNESS_HOURS,
        self.freshness_hours
      ));
    }
    if !(0..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
      return Err(eyre!(
        "tunables.retention_days must be between 0 and {}, got {}",
        MAX_RETENTION_DAYS,
        self.retention_days
      ));
    }
    Ok(())
  }

  pub fn freshness(&self) -> chrono::Duration {
    chrono::Duration::try_hours(self.freshness_hours.clamp(1, MAX_FRESHNESS_HOURS))
      .unwrap_or(chrono::Duration::zero())
  }

  pub fn retention(&self) -> chrono::Duration {
    chrono::Duration::try_days(self.retention_days.clamp(0, MAX_RETENTION_DAYS))
      .unwrap_or(chrono::Duration::zero())
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs)
  }

  pub fn probe_timeout(&self) -> Duration {
    Duration::from_millis(self.probe_timeout_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn stale_check_interval(&self) -> Duration {
    Duration::from_secs(self.stale_check_interval_secs)
  }

  pub fn banner_settle(&self) -> Duration {
    Duration::from_millis(self.banner_settle_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
  /// Version tag embedded in the cache name; bump it to drop every cached asset
  pub generation: String,
  pub cache_prefix: String,
  /// Routes fetched into the cache on install
  pub shell: Vec<String>,
  pub static_prefixes: Vec<String>,
  /// Paths that always hit the network and are never cached
  pub excluded_prefixes: Vec<String>,
  pub offline_page: String,
}

impl Default for AssetConfig {
  fn default() -> Self {
    Self {
      generation: "v1".to_string(),
      cache_prefix: "scout-shell".to_string(),
      shell: vec![
        "/".to_string(),
        "/static/js/app.js".to_string(),
        "/static/css/app.css".to_string(),
        "/scouting".to_string(),
        "/offline".to_string(),
      ],
      static_prefixes: vec!["/static/".to_string()],
      excluded_prefixes: vec!["/analytics".to_string(), "/admin".to_string()],
      offline_page: "/offline".to_string(),
    }
  }
}

impl AssetConfig {
  pub fn cache_name(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.generation)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  ///
  /// Returns `None` only when no file was given and none was found. A file
  /// that exists but fails to parse or validate is always an error.
  pub fn load(explicit_path: Option<&Path>) -> Result<Option<Self>> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    path.map(|p| Self::load_from_path(&p)).transpose()
  }

  /// Load from file, falling back to `server_url` only when no file exists.
  /// `server_url` also overrides the URL of a loaded file.
  pub fn resolve(explicit_path: Option<&Path>, server_url: Option<&str>) -> Result<Self> {
    match (Self::load(explicit_path)?, server_url) {
      (Some(mut config), Some(url)) => {
        config.server.url = url.to_string();
        Ok(config)
      }
      (Some(config), None) => Ok(config),
      (None, Some(url)) => Ok(Self::for_server(url)),
      (None, None) => Err(eyre!(
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml\n\
                 or pass --server-url."
      )),
    }
  }

  /// Minimal configuration pointing at `url`, used when no file exists.
  pub fn for_server(url: &str) -> Self {
    Self {
      server: ServerConfig::with_url(url),
      data_dir: None,
      tunables: Tunables::default(),
      assets: AssetConfig::default(),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
    config
      .tunables
      .validate()
      .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
    Ok(config)
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Directory holding the key-value store, asset cache and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fieldsync"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("server:\n  url: https://scout.example.org\n").unwrap();
    assert_eq!(config.server.health_path, "/health");
    assert_eq!(config.server.save_path, "/scouting/api/save");
    assert_eq!(config.tunables.freshness(), chrono::Duration::hours(24));
    assert_eq!(config.tunables.retention(), chrono::Duration::days(7));
    assert_eq!(config.tunables.probe_interval(), Duration::from_secs(15));
    assert_eq!(config.tunables.probe_timeout(), Duration::from_millis(2500));
    assert_eq!(config.assets.cache_name(), "scout-shell-v1");
  }

  #[test]
  fn test_partial_overrides() {
    let yaml = r#"
server:
  url: http://localhost:5000
  save_path: /api/v2/save
tunables:
  probe_timeout_ms: 1000
assets:
  generation: "2024.10.3"
  excluded_prefixes: ["/admin"]
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.server.save_path, "/api/v2/save");
    assert_eq!(config.server.form_path, "/scouting/form");
    assert_eq!(config.tunables.probe_timeout_ms, 1000);
    assert_eq!(config.tunables.probe_interval_secs, 15);
    assert_eq!(config.assets.cache_name(), "scout-shell-2024.10.3");
    assert_eq!(config.assets.excluded_prefixes, vec!["/admin"]);
    assert_eq!(config.assets.offline_page, "/offline");
  }

  #[test]
  fn test_missing_server_is_an_error() {
    assert!(Config::parse("tunables: {}\n").is_err());
  }

  #[test]
  fn test_explicit_data_dir_wins() {
    let mut config = Config::for_server("http://localhost");
    config.data_dir = Some(PathBuf::from("/tmp/scout"));
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/scout"));
  }

  fn write_temp(name: &str, contents: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fieldsync-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
  }

  #[test]
  fn test_zero_intervals_are_rejected() {
    let mut tunables = Tunables::default();
    assert!(tunables.validate().is_ok());

    tunables.probe_interval_secs = 0;
    let err = tunables.validate().unwrap_err().to_string();
    assert!(err.contains("probe_interval_secs"));

    let mut tunables = Tunables::default();
    tunables.stale_check_interval_secs = 0;
    assert!(tunables.validate().is_err());
  }

  #[test]
  fn test_out_of_range_windows_are_rejected() {
    let mut tunables = Tunables::default();
    tunables.freshness_hours = i64::MAX;
    assert!(tunables.validate().is_err());
    // Accessors stay panic-free even on unvalidated values.
    assert_eq!(tunables.freshness(), chrono::Duration::hours(MAX_FRESHNESS_HOURS));

    let mut tunables = Tunables::default();
    tunables.retention_days = i64::MAX;
    assert!(tunables.validate().is_err());
    assert_eq!(tunables.retention(), chrono::Duration::days(MAX_RETENTION_DAYS));

    let mut tunables = Tunables::default();
    tunables.retention_days = -1;
    assert!(tunables.validate().is_err());
  }

  #[test]
  fn test_invalid_tunables_fail_load() {
    let path = write_temp(
      "zero-probe.yaml",
      "server:\n  url: http://localhost\ntunables:\n  probe_interval_secs: 0\n",
    );
    let err = Config::load(Some(path.as_path())).unwrap_err().to_string();
    assert!(err.contains("probe_interval_secs"));
  }

  #[test]
  fn test_server_url_does_not_mask_broken_config() {
    let path = write_temp("broken.yaml", "server: [not a map\n");
    assert!(Config::resolve(Some(path.as_path()), Some("http://localhost:5000")).is_err());

    let path = write_temp("good.yaml", "server:\n  url: http://old\n");
    let config = Config::resolve(Some(path.as_path()), Some("http://new")).unwrap();
    assert_eq!(config.server.url, "http://new");
  }
}
