use anyhow::Context;
use reqwest::Url;
use std::fmt;
use std::net::Ipv6Addr;

/// CGI path of the relay served by every mesh node.
pub const PROXY_PATH: &str = "/cgi-bin/fwproxy";

/// Where an attempt obtains its manifest and image from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateSource {
  /// A download mirror base URL from the branch configuration.
  Direct { mirror: String },
  /// A neighbouring node relaying for us, reachable link-local on `interface`.
  Proxied { address: Ipv6Addr, interface: String },
}

/// A concrete URL plus the interface the request must leave through.
///
/// Link-local addresses need a zone, which URL parsers reject, so the zone
/// travels next to the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
  pub url: Url,
  pub bind_interface: Option<String>,
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.bind_interface {
      Some(iface) => write!(f, "{} (via {iface})", self.url),
      None => write!(f, "{}", self.url),
    }
  }
}

impl fmt::Display for UpdateSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      UpdateSource::Direct { mirror } => write!(f, "mirror {mirror}"),
      UpdateSource::Proxied { address, interface } => write!(f, "neighbour {address}%{interface}"),
    }
  }
}

pub fn manifest_file_name(branch: &str) -> String {
  format!("{branch}.manifest")
}

impl UpdateSource {
  pub fn manifest_endpoint(&self, branch: &str) -> anyhow::Result<Endpoint> {
    self.endpoint_for(branch, &manifest_file_name(branch))
  }

  pub fn image_endpoint(&self, branch: &str, image: &str) -> anyhow::Result<Endpoint> {
    self.endpoint_for(branch, image)
  }

  fn endpoint_for(&self, branch: &str, file: &str) -> anyhow::Result<Endpoint> {
    match self {
      UpdateSource::Direct { mirror } => {
        let url = mirror_file_url(mirror, file)?;
        Ok(Endpoint {
          url,
          bind_interface: None,
        })
      }
      UpdateSource::Proxied { address, interface } => {
        let mut url = Url::parse(&format!("http://[{address}]{PROXY_PATH}"))
          .with_context(|| format!("build relay URL for {address}"))?;
        url.query_pairs_mut().append_pair("branch", branch).append_pair("file", file);
        Ok(Endpoint {
          url,
          bind_interface: Some(interface.clone()),
        })
      }
    }
  }
}

/// `{mirror}/{file}` with exactly one slash between the parts.
pub fn mirror_file_url(mirror: &str, file: &str) -> anyhow::Result<Url> {
  let joined = format!("{}/{}", mirror.trim_end_matches('/'), file);
  Url::parse(&joined).with_context(|| format!("invalid mirror URL: {joined}"))
}

/// Host and path only, for logs. Query strings can carry user input.
pub fn safe_url_label(url: &Url) -> String {
  let host = url.host_str().unwrap_or("<no-host>");
  let mut path = url.path().to_string();
  if path.is_empty() {
    path = "/".to_string();
  }
  format!("{host}{path}")
}
