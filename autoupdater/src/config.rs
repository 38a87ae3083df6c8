use crate::neighbour::default_mesh_protocols;
use crate::paths;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
  pub enabled: bool,
  pub branch: String,
  pub logging: LoggingConfig,
  pub branches: BTreeMap<String, BranchConfig>,
  pub network: NetworkConfig,
  pub paths: PathsConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      enabled: false,
      branch: default_branch(),
      logging: LoggingConfig::default(),
      branches: BTreeMap::new(),
      network: NetworkConfig::default(),
      paths: PathsConfig::default(),
    }
  }
}

impl Config {
  /// Looks up a branch section by its key.
  pub fn branch_config(&self, key: &str) -> anyhow::Result<&BranchConfig> {
    self
      .branches
      .get(key)
      .ok_or_else(|| anyhow::anyhow!("unknown branch: {key}"))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default = "default_log_level")]
  pub level: String,

  /// Daily rolling log files are written here when set.
  #[serde(default)]
  pub dir: Option<PathBuf>,

  #[serde(default = "default_retention_days")]
  pub retention_days: u64,
}

fn default_log_level() -> String {
  "info".to_string()
}

fn default_retention_days() -> u64 {
  7
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      dir: None,
      retention_days: default_retention_days(),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BranchConfig {
  /// Branch name as it appears in manifests. Defaults to the section key.
  #[serde(default)]
  pub name: String,

  #[serde(default)]
  pub mirrors: Vec<String>,

  #[serde(default = "default_good_signatures")]
  pub good_signatures: usize,

  /// Hex-encoded ed25519 public keys.
  #[serde(default)]
  pub pubkeys: Vec<String>,
}

fn default_good_signatures() -> usize {
  1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_fetch_timeout_seconds")]
  pub fetch_timeout_seconds: u64,

  #[serde(default = "default_connect_timeout_seconds")]
  pub connect_timeout_seconds: u64,

  #[serde(default = "default_respondd_port")]
  pub respondd_port: u16,

  #[serde(default = "default_discovery_timeout_seconds")]
  pub discovery_timeout_seconds: u64,

  #[serde(default = "default_mesh_protocols")]
  pub mesh_protocols: Vec<String>,
}

impl NetworkConfig {
  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_seconds)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_secs(self.connect_timeout_seconds)
  }

  pub fn discovery_timeout(&self) -> Duration {
    Duration::from_secs(self.discovery_timeout_seconds)
  }
}

fn default_fetch_timeout_seconds() -> u64 {
  300
}

fn default_connect_timeout_seconds() -> u64 {
  10
}

fn default_respondd_port() -> u16 {
  crate::discovery::RESPONDD_PORT
}

fn default_discovery_timeout_seconds() -> u64 {
  3
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      fetch_timeout_seconds: default_fetch_timeout_seconds(),
      connect_timeout_seconds: default_connect_timeout_seconds(),
      respondd_port: default_respondd_port(),
      discovery_timeout_seconds: default_discovery_timeout_seconds(),
      mesh_protocols: default_mesh_protocols(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
  #[serde(default = "paths::default_lock_file")]
  pub lock_file: PathBuf,

  #[serde(default = "paths::default_firmware_file")]
  pub firmware_file: PathBuf,

  #[serde(default = "paths::default_sysupgrade")]
  pub sysupgrade: PathBuf,

  #[serde(default = "paths::default_hooks_dir")]
  pub hooks_dir: PathBuf,

  #[serde(default = "paths::default_release_file")]
  pub release_file: PathBuf,

  #[serde(default = "paths::default_image_name_file")]
  pub image_name_file: PathBuf,

  #[serde(default = "paths::default_proxy_lock_file")]
  pub proxy_lock_file: PathBuf,
}

impl Default for PathsConfig {
  fn default() -> Self {
    Self {
      lock_file: paths::default_lock_file(),
      firmware_file: paths::default_firmware_file(),
      sysupgrade: paths::default_sysupgrade(),
      hooks_dir: paths::default_hooks_dir(),
      release_file: paths::default_release_file(),
      image_name_file: paths::default_image_name_file(),
      proxy_lock_file: paths::default_proxy_lock_file(),
    }
  }
}

fn default_branch() -> String {
  "stable".to_string()
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigFile {
  #[serde(default)]
  pub enabled: Option<bool>,

  #[serde(default)]
  pub branch: Option<String>,

  #[serde(default)]
  pub logging: Option<LoggingConfig>,

  #[serde(default)]
  pub branches: BTreeMap<String, BranchConfig>,

  #[serde(default)]
  pub network: Option<NetworkConfig>,

  #[serde(default)]
  pub paths: Option<PathsConfig>,
}

impl ConfigFile {
  fn normalize(self) -> Config {
    let mut cfg = Config::default();
    if let Some(enabled) = self.enabled {
      cfg.enabled = enabled;
    }
    if let Some(branch) = self.branch {
      cfg.branch = branch;
    }
    if let Some(l) = self.logging {
      cfg.logging = l;
    }
    if let Some(n) = self.network {
      cfg.network = n;
    }
    if let Some(p) = self.paths {
      cfg.paths = p;
    }

    for (key, mut branch) in self.branches {
      if branch.name.is_empty() {
        branch.name = key.clone();
      }
      cfg.branches.insert(key, branch);
    }

    if let Some(reason) = validate_network_config(&cfg.network) {
      eprintln!("autoupdater: network config invalid ({reason}); using defaults");
      cfg.network = NetworkConfig::default();
    }

    cfg
  }
}

/// Reads the configuration at `path`.
///
/// A missing file yields defaults. A file that exists but does not parse
/// also yields defaults, with a warning; the file is never rewritten. Any
/// other read error is returned.
pub fn load(path: &Path) -> anyhow::Result<Config> {
  let raw = match fs::read_to_string(path) {
    Ok(raw) => raw,
    Err(e) if e.kind() == io::ErrorKind::NotFound => {
      eprintln!("autoupdater: config missing at {}; using defaults", path.display());
      return Ok(Config::default());
    }
    Err(e) => return Err(e).with_context(|| format!("read config {}", path.display())),
  };

  match parse(&raw) {
    Ok(cfg) => Ok(cfg),
    Err(e) => {
      eprintln!("autoupdater: invalid config at {}; using defaults: {e:#}", path.display());
      Ok(Config::default())
    }
  }
}

pub fn parse(raw: &str) -> anyhow::Result<Config> {
  let file = toml::from_str::<ConfigFile>(raw).context("parse config TOML")?;
  Ok(file.normalize())
}

fn validate_network_config(cfg: &NetworkConfig) -> Option<String> {
  if cfg.fetch_timeout_seconds == 0 {
    return Some("fetch_timeout_seconds must be > 0".to_string());
  }
  if cfg.connect_timeout_seconds == 0 {
    return Some("connect_timeout_seconds must be > 0".to_string());
  }
  if cfg.discovery_timeout_seconds == 0 {
    return Some("discovery_timeout_seconds must be > 0".to_string());
  }
  if cfg.respondd_port == 0 {
    return Some("respondd_port must be > 0".to_string());
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_file_gives_defaults() {
    let cfg = parse("").unwrap();
    assert!(!cfg.enabled);
    assert_eq!(cfg.branch, "stable");
    assert_eq!(cfg.logging.level, "info");
    assert_eq!(cfg.logging.dir, None);
    assert_eq!(cfg.network.fetch_timeout_seconds, 300);
    assert_eq!(cfg.network.connect_timeout_seconds, 10);
    assert_eq!(cfg.network.respondd_port, 1001);
    assert_eq!(cfg.network.discovery_timeout(), Duration::from_secs(3));
    assert_eq!(cfg.network.mesh_protocols, vec!["gluon_mesh", "gluon_wired"]);
    assert_eq!(cfg.paths.lock_file, PathBuf::from("/var/lock/autoupdater.lock"));
    assert_eq!(cfg.paths.firmware_file, PathBuf::from("/tmp/firmware.bin"));
    assert!(cfg.branches.is_empty());
  }

  #[test]
  fn full_file_round_trips_fields() {
    let cfg = parse(
      r#"
enabled = true
branch = "beta"

[logging]
level = "debug"
dir = "/var/log/autoupdater"

[branches.stable]
mirrors = ["http://a/stable"]
pubkeys = ["aa"]

[branches.beta]
name = "experimental"
mirrors = ["http://a/beta", "http://b/beta"]
good_signatures = 2
pubkeys = ["aa", "bb"]

[network]
fetch_timeout_seconds = 60

[paths]
firmware_file = "/tmp/fw.bin"
"#,
    )
    .unwrap();

    assert!(cfg.enabled);
    assert_eq!(cfg.branch, "beta");
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.logging.retention_days, 7);
    assert_eq!(cfg.logging.dir, Some(PathBuf::from("/var/log/autoupdater")));

    let stable = cfg.branch_config("stable").unwrap();
    assert_eq!(stable.name, "stable");
    assert_eq!(stable.good_signatures, 1);

    let beta = cfg.branch_config("beta").unwrap();
    assert_eq!(beta.name, "experimental");
    assert_eq!(beta.mirrors.len(), 2);
    assert_eq!(beta.good_signatures, 2);

    assert_eq!(cfg.network.fetch_timeout(), Duration::from_secs(60));
    assert_eq!(cfg.network.connect_timeout_seconds, 10);
    assert_eq!(cfg.paths.firmware_file, PathBuf::from("/tmp/fw.bin"));
    assert_eq!(cfg.paths.sysupgrade, PathBuf::from("/sbin/sysupgrade"));
    assert!(cfg.branch_config("nightly").is_err());
  }

  #[test]
  fn zero_timeouts_fall_back_to_network_defaults() {
    let cfg = parse("[network]\nconnect_timeout_seconds = 0\nrespondd_port = 2000\n").unwrap();
    assert_eq!(cfg.network.connect_timeout_seconds, 10);
    assert_eq!(cfg.network.respondd_port, 1001);
  }

  #[test]
  fn load_handles_missing_and_invalid_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autoupdater.toml");

    let cfg = load(&path).unwrap();
    assert!(!cfg.enabled);

    fs::write(&path, "enabled = [[[").unwrap();
    let cfg = load(&path).unwrap();
    assert!(!cfg.enabled);
    assert_eq!(fs::read_to_string(&path).unwrap(), "enabled = [[[");

    fs::write(&path, "enabled = true\n").unwrap();
    assert!(load(&path).unwrap().enabled);
  }

  #[test]
  fn unreadable_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    // A directory cannot be read as a file.
    assert!(load(dir.path()).is_err());
  }
}
