use crate::neighbour::MeshInterface;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::ffi::CString;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

/// What the updater needs to know about the node it runs on.
pub trait LocalSystem {
  /// Hardware model name as used in manifests. `None` when unknown.
  fn image_name(&self) -> Option<String>;
  fn firmware_version(&self) -> anyhow::Result<String>;
  fn interfaces(&self) -> anyhow::Result<Vec<MeshInterface>>;
  fn uptime(&self) -> Duration;
}

/// Reads release information from the filesystem and interfaces from ubus.
#[derive(Debug, Clone)]
pub struct OpenWrtSystem {
  pub release_file: PathBuf,
  pub image_name_file: PathBuf,
  pub uptime_file: PathBuf,
}

impl OpenWrtSystem {
  pub fn new(release_file: PathBuf, image_name_file: PathBuf) -> Self {
    Self {
      release_file,
      image_name_file,
      uptime_file: PathBuf::from("/proc/uptime"),
    }
  }
}

impl LocalSystem for OpenWrtSystem {
  fn image_name(&self) -> Option<String> {
    let raw = fs::read_to_string(&self.image_name_file).ok()?;
    let name = raw.trim();
    (!name.is_empty()).then(|| name.to_string())
  }

  fn firmware_version(&self) -> anyhow::Result<String> {
    let raw = fs::read_to_string(&self.release_file)
      .with_context(|| format!("read firmware release from {}", self.release_file.display()))?;
    let version = raw.trim();
    if version.is_empty() {
      anyhow::bail!("firmware release file {} is empty", self.release_file.display());
    }
    Ok(version.to_string())
  }

  fn interfaces(&self) -> anyhow::Result<Vec<MeshInterface>> {
    let output = Command::new("ubus")
      .args(["call", "network.interface", "dump"])
      .output()
      .context("run ubus call network.interface dump")?;
    if !output.status.success() {
      anyhow::bail!("ubus call network.interface dump failed: {}", output.status);
    }
    parse_interface_dump(&output.stdout, if_index)
  }

  fn uptime(&self) -> Duration {
    fs::read_to_string(&self.uptime_file)
      .ok()
      .and_then(|raw| parse_uptime(&raw))
      .unwrap_or_default()
  }
}

/// First field of /proc/uptime, in seconds.
fn parse_uptime(raw: &str) -> Option<Duration> {
  let secs: f64 = raw.split_whitespace().next()?.parse().ok()?;
  if !secs.is_finite() || secs < 0.0 {
    return None;
  }
  Some(Duration::from_secs_f64(secs))
}

#[derive(Debug, Deserialize)]
struct InterfaceDump {
  #[serde(default)]
  interface: Vec<InterfaceEntry>,
}

#[derive(Debug, Deserialize)]
struct InterfaceEntry {
  #[serde(default)]
  device: Option<String>,
  #[serde(default)]
  up: bool,
  #[serde(default)]
  proto: Option<String>,
}

/// Parses `ubus call network.interface dump` output. Entries without a
/// device or whose device has no kernel index are skipped; the first entry
/// per index wins.
fn parse_interface_dump(raw: &[u8], index_of: impl Fn(&str) -> u32) -> anyhow::Result<Vec<MeshInterface>> {
  let dump: InterfaceDump = serde_json::from_slice(raw).context("parse network.interface dump")?;
  let mut seen = HashSet::new();
  let mut out = Vec::new();

  for entry in dump.interface {
    let Some(device) = entry.device else {
      continue;
    };
    let index = index_of(&device);
    if index == 0 || !seen.insert(index) {
      continue;
    }
    out.push(MeshInterface {
      name: device,
      index,
      up: entry.up,
      protocol: entry.proto.unwrap_or_default(),
    });
  }

  Ok(out)
}

fn if_index(name: &str) -> u32 {
  let Ok(c_name) = CString::new(name) else {
    return 0;
  };
  // SAFETY: `c_name` is a valid NUL-terminated string for the duration of
  // the call; if_nametoindex does not retain the pointer.
  unsafe { libc::if_nametoindex(c_name.as_ptr()) }
}
