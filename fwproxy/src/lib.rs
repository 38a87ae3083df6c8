//! CGI relay that fetches a firmware file from the upstream mirrors of a
//! branch on behalf of a neighbouring node without direct uplink.

use autoupdater::config::Config;
use autoupdater::lock::{LockError, RunLock};
use autoupdater::source::{mirror_file_url, safe_url_label, Endpoint};
use autoupdater::transport::{FetchSink, HttpTransport, Transport};
use rand::seq::SliceRandom;
use rand::Rng;
use std::io::Write;
use std::path::Path;

pub mod cli;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
  pub branch: String,
  pub file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  BadRequest,
  ServiceUnavailable,
  BadGateway,
}

impl Status {
  fn line(self) -> &'static str {
    match self {
      Status::BadRequest => "400 Bad Request",
      Status::ServiceUnavailable => "503 Service Unavailable",
      Status::BadGateway => "502 Bad Gateway",
    }
  }
}

#[derive(Debug)]
pub enum Outcome {
  /// A mirror delivered the file.
  Relayed { mirror: String },
  /// An error status was written instead of a body.
  Failed(Status),
  /// The body was cut off after the headers went out.
  Interrupted(anyhow::Error),
}

/// Extracts `branch` and `file` from a CGI query string.
pub fn parse_query(query: &str) -> Result<ProxyRequest, String> {
  let mut branch = None;
  let mut file = None;
  for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
    match k.as_ref() {
      "branch" if branch.is_none() => branch = Some(v.into_owned()),
      "file" if file.is_none() => file = Some(v.into_owned()),
      _ => {}
    }
  }

  let branch = branch.filter(|b| !b.is_empty()).ok_or("missing parameter 'branch'")?;
  let file = file.filter(|f| !f.is_empty()).ok_or("missing parameter 'file'")?;
  if !is_plain_file_name(&file) {
    return Err(format!("invalid file name: {file}"));
  }
  Ok(ProxyRequest { branch, file })
}

/// Accepts names made of letters, digits and `._+~-` only, excluding the
/// directory entries `.` and `..`.
fn is_plain_file_name(file: &str) -> bool {
  file != "."
    && file != ".."
    && file
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'+' | b'~' | b'-'))
}

/// Mirrors of the branch whose manifest name (or section key) is `branch`.
pub fn branch_mirrors(cfg: &Config, branch: &str) -> Option<Vec<String>> {
  cfg
    .branches
    .values()
    .find(|b| b.name == branch)
    .or_else(|| cfg.branches.get(branch))
    .map(|b| b.mirrors.clone())
}

pub struct Relay<'a, R: Rng> {
  pub cfg: &'a Config,
  pub transport: &'a dyn Transport,
  pub lock_path: &'a Path,
  pub rng: R,
}

impl<R: Rng> Relay<'_, R> {
  /// Serves one request, writing the full CGI response to `out`.
  pub fn serve(&mut self, query: Option<&str>, out: &mut dyn Write) -> anyhow::Result<Outcome> {
    let _lock = match RunLock::acquire(self.lock_path) {
      Ok(lock) => Some(lock),
      Err(LockError::Busy(_)) => {
        tracing::warn!("failed to acquire lock, exiting");
        return fail(out, Status::ServiceUnavailable, "another transfer is in progress");
      }
      Err(e) => {
        tracing::warn!(error = %e, "continuing without lock");
        None
      }
    };

    let Some(query) = query else {
      tracing::warn!("no query string found");
      return fail(out, Status::BadRequest, "no query string");
    };
    let req = match parse_query(query) {
      Ok(r) => r,
      Err(msg) => {
        tracing::warn!(reason = %msg, "rejecting request");
        return fail(out, Status::BadRequest, &msg);
      }
    };

    let Some(mut mirrors) = branch_mirrors(self.cfg, &req.branch) else {
      tracing::warn!(branch = %req.branch, "unknown branch");
      return fail(out, Status::BadRequest, "unknown branch");
    };
    mirrors.shuffle(&mut self.rng);

    for mirror in mirrors {
      let url = match mirror_file_url(&mirror, &req.file) {
        Ok(u) => u,
        Err(e) => {
          tracing::warn!(mirror = %mirror, error = %format!("{e:#}"), "skipping mirror");
          continue;
        }
      };
      let endpoint = Endpoint {
        url,
        bind_interface: None,
      };

      if let Err(e) = self.transport.probe(&endpoint) {
        tracing::warn!(mirror = %mirror, error = %format!("{e:#}"), "file not found on mirror, skipping");
        continue;
      }

      let mut sink = CgiSink {
        out: &mut *out,
        content_type: content_type_for(&req.file),
        started: false,
      };
      match self.transport.fetch(&endpoint, &mut sink) {
        Ok(()) => {
          tracing::info!(url = %safe_url_label(&endpoint.url), "relayed file");
          return Ok(Outcome::Relayed { mirror });
        }
        Err(e) if sink.started => {
          tracing::error!(url = %safe_url_label(&endpoint.url), error = %format!("{e:#}"), "transfer interrupted");
          return Ok(Outcome::Interrupted(e));
        }
        Err(e) => {
          tracing::warn!(mirror = %mirror, error = %format!("{e:#}"), "download failed, skipping mirror");
        }
      }
    }

    fail(out, Status::BadGateway, "no mirror could deliver the file")
  }
}

fn fail(out: &mut dyn Write, status: Status, message: &str) -> anyhow::Result<Outcome> {
  write!(
    out,
    "Status: {}\r\nContent-Type: text/plain\r\n\r\n{message}\n",
    status.line()
  )?;
  out.flush()?;
  Ok(Outcome::Failed(status))
}

fn content_type_for(file: &str) -> &'static str {
  if file.ends_with(".manifest") {
    "text/plain"
  } else {
    "application/octet-stream"
  }
}

struct CgiSink<'w> {
  out: &'w mut dyn Write,
  content_type: &'static str,
  started: bool,
}

impl FetchSink for CgiSink<'_> {
  fn on_header(&mut self, content_length: Option<u64>) -> anyhow::Result<()> {
    self.started = true;
    write!(self.out, "Status: 200 OK\r\nContent-Type: {}\r\n", self.content_type)?;
    if let Some(len) = content_length {
      write!(self.out, "Content-Length: {len}\r\n")?;
    }
    self.out.write_all(b"\r\n")?;
    Ok(())
  }

  fn on_data(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
    self.out.write_all(chunk)?;
    Ok(())
  }

  fn on_eof(&mut self) -> anyhow::Result<()> {
    self.out.flush()?;
    Ok(())
  }
}

pub fn run(config_path: &Path) -> anyhow::Result<()> {
  let cfg = autoupdater::config::load(config_path)?;
  autoupdater::logging::init(
    &cfg.logging.level,
    cfg.logging.dir.as_deref(),
    cfg.logging.retention_days,
    "fwproxy",
  )?;

  let transport = HttpTransport::new(cfg.network.connect_timeout(), cfg.network.fetch_timeout());
  let query = std::env::var("QUERY_STRING").ok();

  let mut relay = Relay {
    cfg: &cfg,
    transport: &transport,
    lock_path: &cfg.paths.proxy_lock_file,
    rng: rand::thread_rng(),
  };
  let stdout = std::io::stdout();
  let mut out = stdout.lock();
  match relay.serve(query.as_deref(), &mut out)? {
    Outcome::Interrupted(e) => Err(e),
    Outcome::Relayed { .. } | Outcome::Failed(_) => Ok(()),
  }
}
