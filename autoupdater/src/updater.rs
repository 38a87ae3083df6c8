//! One updater run: try each update source in turn until one yields a
//! verified image (or a benign reason to stop), then hand the image to the
//! flashing tool.

use crate::crypto::{self, HashState};
use crate::discovery::Requester;
use crate::hooks::{Actions, HookKind};
use crate::lock::RunLock;
use crate::manifest::{parse_line, LineSplitter, Manifest};
use crate::neighbour::{self, Neighbour};
use crate::rollout;
use crate::settings::Settings;
use crate::source::{Endpoint, UpdateSource};
use crate::system::LocalSystem;
use crate::transport::{FetchSink, Transport};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ways a run can end successfully without flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
  /// The manifest offers nothing newer.
  UpToDate,
  /// The rollout dice said not yet.
  Deferred,
  /// Image downloaded and verified, flashing skipped on request.
  Simulated,
}

impl fmt::Display for AttemptOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let text = match self {
      AttemptOutcome::UpToDate => "no new firmware available",
      AttemptOutcome::Deferred => "no autoupdate this time",
      AttemptOutcome::Simulated => "upgrade simulated",
    };
    f.write_str(text)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
  /// This source is unusable; the next one may work.
  #[error("{0:#}")]
  Source(anyhow::Error),
  /// Local resource failure; no other source can help.
  #[error("{0:#}")]
  Fatal(anyhow::Error),
}

/// External collaborators of a run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
  pub transport: &'a dyn Transport,
  pub system: &'a dyn LocalSystem,
  pub actions: &'a dyn Actions,
  pub requester: &'a dyn Requester,
}

#[derive(Debug, Clone)]
pub struct DiscoveryParams {
  pub port: u16,
  pub budget: Duration,
  pub mesh_protocols: Vec<String>,
}

pub struct Updater<'a> {
  settings: &'a Settings,
  env: Collaborators<'a>,
  lock: &'a RunLock,
  firmware_path: PathBuf,
  discovery: DiscoveryParams,
  image_name: String,
  rng: StdRng,
  clock: fn() -> DateTime<Utc>,
}

impl<'a> Updater<'a> {
  pub fn new(
    settings: &'a Settings,
    env: Collaborators<'a>,
    lock: &'a RunLock,
    firmware_path: PathBuf,
    discovery: DiscoveryParams,
    image_name: String,
  ) -> Self {
    Self {
      settings,
      env,
      lock,
      firmware_path,
      discovery,
      image_name,
      rng: StdRng::from_entropy(),
      clock: Utc::now,
    }
  }

  pub fn with_rng(mut self, rng: StdRng) -> Self {
    self.rng = rng;
    self
  }

  pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
    self.clock = clock;
    self
  }

  /// Tries mirrors, then neighbours, until one attempt ends the run.
  pub fn run(&mut self) -> anyhow::Result<AttemptOutcome> {
    let mut mirrors = self.settings.mirrors.clone();
    while !mirrors.is_empty() {
      let idx = if self.settings.mirrors_external {
        0
      } else {
        self.rng.gen_range(0..mirrors.len())
      };
      let source = UpdateSource::Direct {
        mirror: mirrors.remove(idx),
      };
      if let Some(outcome) = self.try_source(&source)? {
        return Ok(outcome);
      }
    }

    for n in self.discover_neighbours() {
      let source = UpdateSource::Proxied {
        address: n.address,
        interface: n.interface.name.clone(),
      };
      if let Some(outcome) = self.try_source(&source)? {
        return Ok(outcome);
      }
    }

    anyhow::bail!("no usable update source found")
  }

  fn try_source(&mut self, source: &UpdateSource) -> anyhow::Result<Option<AttemptOutcome>> {
    tracing::info!(source = %source, "trying update source");
    match self.attempt(source) {
      Ok(outcome) => {
        tracing::info!(source = %source, outcome = %outcome, "update check finished");
        Ok(Some(outcome))
      }
      Err(AttemptError::Source(e)) => {
        tracing::warn!(source = %source, error = %format!("{e:#}"), "update source failed");
        Ok(None)
      }
      Err(AttemptError::Fatal(e)) => Err(e.context(format!("aborting run at {source}"))),
    }
  }

  /// Neighbours announcing a release worth fetching, in arrival order.
  fn discover_neighbours(&self) -> Vec<Neighbour<String>> {
    let interfaces = match self.env.system.interfaces() {
      Ok(i) => i,
      Err(e) => {
        tracing::warn!(error = %format!("{e:#}"), "cannot list interfaces; skipping neighbour discovery");
        return Vec::new();
      }
    };

    let found = neighbour::collect(
      self.env.requester,
      &interfaces,
      &self.discovery.mesh_protocols,
      self.discovery.port,
      self.discovery.budget,
      |json, n: &mut Neighbour<String>| {
        n.payload = json
          .pointer("/software/firmware/release")
          .and_then(serde_json::Value::as_str)
          .map(str::to_string);
        Ok(true)
      },
    );
    let found = match found {
      Ok(f) => f,
      Err(e) => {
        tracing::warn!(error = %format!("{e:#}"), "neighbour discovery failed");
        return Vec::new();
      }
    };

    found
      .into_iter()
      .filter(|n| match n.payload.as_deref() {
        None => {
          tracing::debug!(node_id = %n.node_id, "neighbour announces no firmware release");
          false
        }
        Some(v) if !self.settings.force && !rollout::version_is_newer(v, &self.settings.old_version) => {
          tracing::debug!(node_id = %n.node_id, version = v, "neighbour firmware is not newer");
          false
        }
        Some(_) => true,
      })
      .collect()
  }

  /// Runs the full pipeline against one source.
  pub fn attempt(&mut self, source: &UpdateSource) -> Result<AttemptOutcome, AttemptError> {
    let s = self.settings;
    let manifest_ep = source.manifest_endpoint(&s.branch).map_err(AttemptError::Source)?;

    let m = self.fetch_manifest(&manifest_ep).map_err(AttemptError::Source)?;

    let good = crypto::verify(&m.signed_digest(), &m.signatures, &s.pubkeys);
    if good < s.required_good_signatures {
      return Err(AttemptError::Source(anyhow::anyhow!(
        "manifest {manifest_ep} only carried {good} valid signatures, {} are required",
        s.required_good_signatures
      )));
    }

    if let Err(rejection) = m.check_fields() {
      return Err(AttemptError::Source(
        anyhow::anyhow!("{rejection}").context(format!("manifest {manifest_ep} (branch {}, model {})", s.branch, self.image_name)),
      ));
    }

    if !rollout::version_is_newer(&m.version, &s.old_version) && !s.force_version {
      return Ok(AttemptOutcome::UpToDate);
    }

    if !s.force {
      let Some(date) = m.date else {
        return Err(AttemptError::Source(anyhow::anyhow!("manifest {manifest_ep} has no date")));
      };
      let p = rollout::acceptance_probability(date, m.priority, s.fallback, (self.clock)(), self.env.system.uptime());
      let draw: f64 = self.rng.gen();
      if !rollout::accept_update(s.force, p, draw) {
        tracing::info!(probability = p, "no autoupdate this time; use -f to override");
        return Ok(AttemptOutcome::Deferred);
      }
    }

    let image_ep = source
      .image_endpoint(&s.branch, &m.image_filename)
      .map_err(AttemptError::Source)?;

    self.env.actions.run_hooks(HookKind::Download);

    let file = match open_image_file(&self.firmware_path) {
      Ok(f) => f,
      Err(e) => {
        self.env.actions.run_hooks(HookKind::Abort);
        return Err(AttemptError::Fatal(
          anyhow::Error::new(e).context(format!("failed opening firmware file {}", self.firmware_path.display())),
        ));
      }
    };

    tracing::info!(url = %image_ep, version = %m.version, "downloading image");
    let mut sink = ImageSink::new(file, m.image_size);
    if let Err(e) = self.env.transport.fetch(&image_ep, &mut sink) {
      self.discard_image();
      return Err(AttemptError::Source(e.context("error downloading image")));
    }

    let digest = sink.finish();
    if digest != m.image_hash {
      self.discard_image();
      return Err(AttemptError::Source(anyhow::anyhow!("invalid image checksum from {image_ep}")));
    }
    drop(m);

    if s.no_action {
      tracing::info!(
        path = %self.firmware_path.display(),
        "aborting successful upgrade because simulation was requested"
      );
      self.env.actions.run_hooks(HookKind::Abort);
      return Ok(AttemptOutcome::Simulated);
    }

    self.env.actions.run_hooks(HookKind::Upgrade);
    let err = self.env.actions.commit_upgrade(&self.firmware_path, self.lock);
    self.discard_image();
    Err(AttemptError::Source(err))
  }

  fn fetch_manifest(&self, endpoint: &Endpoint) -> anyhow::Result<Manifest> {
    tracing::debug!(url = %endpoint, "retrieving manifest");
    let mut m = Manifest::new();
    let mut sink = ManifestSink {
      manifest: &mut m,
      splitter: LineSplitter::new(),
      branch: &self.settings.branch,
      image_name: &self.image_name,
    };
    self
      .env
      .transport
      .fetch(endpoint, &mut sink)
      .with_context(|| format!("error downloading manifest {endpoint}"))?;
    Ok(m)
  }

  fn discard_image(&self) {
    if let Err(e) = fs::remove_file(&self.firmware_path) {
      if e.kind() != io::ErrorKind::NotFound {
        tracing::warn!(path = %self.firmware_path.display(), error = %e, "failed to remove firmware image");
      }
    }
    self.env.actions.run_hooks(HookKind::Abort);
  }
}

fn open_image_file(path: &Path) -> io::Result<File> {
  OpenOptions::new()
    .write(true)
    .create(true)
    .truncate(true)
    .mode(0o600)
    .open(path)
}

struct ManifestSink<'m> {
  manifest: &'m mut Manifest,
  splitter: LineSplitter,
  branch: &'m str,
  image_name: &'m str,
}

impl FetchSink for ManifestSink<'_> {
  fn on_header(&mut self, _content_length: Option<u64>) -> anyhow::Result<()> {
    Ok(())
  }

  fn on_data(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
    let Self {
      manifest,
      splitter,
      branch,
      image_name,
    } = self;
    splitter.push(chunk, |line| parse_line(line, manifest, branch, image_name))?;
    Ok(())
  }

  fn on_eof(&mut self) -> anyhow::Result<()> {
    let Self {
      manifest,
      splitter,
      branch,
      image_name,
    } = self;
    splitter.finish(|line| parse_line(line, manifest, branch, image_name))?;
    Ok(())
  }
}

/// Writes the image to disk while hashing it, enforcing the size the
/// manifest announced.
struct ImageSink {
  file: File,
  hash: HashState,
  expected_size: Option<u64>,
  written: u64,
}

impl ImageSink {
  fn new(file: File, expected_size: Option<u64>) -> Self {
    Self {
      file,
      hash: HashState::new(),
      expected_size,
      written: 0,
    }
  }

  fn finish(self) -> crypto::Digest {
    self.hash.finalize()
  }
}

impl FetchSink for ImageSink {
  fn on_header(&mut self, content_length: Option<u64>) -> anyhow::Result<()> {
    if let (Some(expected), Some(announced)) = (self.expected_size, content_length) {
      if expected != announced {
        anyhow::bail!("server announced {announced} bytes but manifest says {expected}");
      }
    }
    Ok(())
  }

  fn on_data(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
    let len = chunk.len() as u64;
    if let Some(expected) = self.expected_size {
      if self.written + len > expected {
        anyhow::bail!("image exceeds manifest size of {expected} bytes");
      }
    }
    self.file.write_all(chunk).context("write firmware image")?;
    self.hash.update(chunk);
    self.written += len;
    Ok(())
  }

  fn on_eof(&mut self) -> anyhow::Result<()> {
    self.file.flush().context("flush firmware image")
  }
}
