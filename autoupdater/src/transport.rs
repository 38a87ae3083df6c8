use crate::source::{safe_url_label, Endpoint};
use anyhow::Context;
use reqwest::blocking::{Client, Response};
use reqwest::header::USER_AGENT;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::io::Read;
use std::time::Duration;

pub const MAX_REDIRECTS: usize = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

const CHUNK_SIZE: usize = 16 * 1024;

/// Receives a response body as it streams in. Any error aborts the
/// transfer and is returned from [`Transport::fetch`].
pub trait FetchSink {
  /// Called once before the first chunk with the announced body length.
  fn on_header(&mut self, content_length: Option<u64>) -> anyhow::Result<()>;
  fn on_data(&mut self, chunk: &[u8]) -> anyhow::Result<()>;
  fn on_eof(&mut self) -> anyhow::Result<()>;
}

pub trait Transport {
  /// GET `endpoint` and stream the body into `sink`. A final status other
  /// than 200 is an error.
  fn fetch(&self, endpoint: &Endpoint, sink: &mut dyn FetchSink) -> anyhow::Result<()>;

  /// Cheap existence check for `endpoint`.
  fn probe(&self, endpoint: &Endpoint) -> anyhow::Result<()>;
}

pub fn user_agent() -> String {
  format!("autoupdater/{}", env!("CARGO_PKG_VERSION"))
}

/// Blocking HTTP transport on top of reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
  connect_timeout: Duration,
  timeout: Duration,
}

impl Default for HttpTransport {
  fn default() -> Self {
    Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_FETCH_TIMEOUT)
  }
}

impl HttpTransport {
  pub fn new(connect_timeout: Duration, timeout: Duration) -> Self {
    Self {
      connect_timeout,
      timeout,
    }
  }

  fn client_for(&self, endpoint: &Endpoint) -> anyhow::Result<Client> {
    let mut builder = Client::builder()
      .connect_timeout(self.connect_timeout)
      .timeout(self.timeout)
      .redirect(Policy::limited(MAX_REDIRECTS));
    if let Some(iface) = endpoint.bind_interface.as_deref() {
      builder = builder.interface(iface);
    }
    builder.build().context("build HTTP client")
  }

  fn send(&self, endpoint: &Endpoint, head: bool) -> anyhow::Result<Response> {
    let client = self.client_for(endpoint)?;
    let label = safe_url_label(&endpoint.url);
    let request = if head {
      client.head(endpoint.url.clone())
    } else {
      client.get(endpoint.url.clone())
    };

    let response = request
      .header(USER_AGENT, user_agent())
      .send()
      .with_context(|| format!("{} {label}", if head { "HEAD" } else { "GET" }))?;

    if response.status() != StatusCode::OK {
      anyhow::bail!("unexpected HTTP status {} for {label}", response.status().as_u16());
    }
    Ok(response)
  }
}

impl Transport for HttpTransport {
  fn fetch(&self, endpoint: &Endpoint, sink: &mut dyn FetchSink) -> anyhow::Result<()> {
    let response = self.send(endpoint, false)?;
    sink.on_header(response.content_length())?;
    stream_body(response, sink).with_context(|| format!("download {}", safe_url_label(&endpoint.url)))
  }

  fn probe(&self, endpoint: &Endpoint) -> anyhow::Result<()> {
    self.send(endpoint, true).map(|_| ())
  }
}

fn stream_body(mut body: impl Read, sink: &mut dyn FetchSink) -> anyhow::Result<()> {
  let mut buf = vec![0u8; CHUNK_SIZE];
  loop {
    let n = match body.read(&mut buf) {
      Ok(0) => break,
      Ok(n) => n,
      Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
      Err(e) => return Err(e).context("read response body"),
    };
    sink.on_data(&buf[..n])?;
  }
  sink.on_eof()
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Url;
  use std::io::Write;
  use std::net::TcpListener;
  use std::thread::JoinHandle;

  /// Collects a whole body in memory, up to `limit` bytes.
  #[derive(Debug, Default)]
  struct BufferSink {
    data: Vec<u8>,
    content_length: Option<u64>,
    finished: bool,
    limit: Option<usize>,
  }

  impl BufferSink {
    fn with_limit(limit: usize) -> Self {
      Self {
        limit: Some(limit),
        ..Self::default()
      }
    }
  }

  impl FetchSink for BufferSink {
    fn on_header(&mut self, content_length: Option<u64>) -> anyhow::Result<()> {
      self.content_length = content_length;
      Ok(())
    }

    fn on_data(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
      if let Some(limit) = self.limit {
        if self.data.len() + chunk.len() > limit {
          anyhow::bail!("response exceeds max size {limit} bytes");
        }
      }
      self.data.extend_from_slice(chunk);
      Ok(())
    }

    fn on_eof(&mut self) -> anyhow::Result<()> {
      self.finished = true;
      Ok(())
    }
  }

  /// Serves the given raw HTTP responses, one per accepted connection.
  fn serve(responses: Vec<String>) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let handle = std::thread::spawn(move || {
      let mut requests = Vec::new();
      for response in responses {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        let mut req = Vec::new();
        while !req.windows(4).any(|w| w == b"\r\n\r\n") {
          let n = stream.read(&mut buf).unwrap();
          if n == 0 {
            break;
          }
          req.extend_from_slice(&buf[..n]);
        }
        requests.push(String::from_utf8_lossy(&req).to_string());
        stream.write_all(response.as_bytes()).unwrap();
      }
      requests
    });
    (base, handle)
  }

  fn endpoint(base: &str, path: &str) -> Endpoint {
    Endpoint {
      url: Url::parse(&format!("{base}{path}")).unwrap(),
      bind_interface: None,
    }
  }

  fn ok(body: &str) -> String {
    format!(
      "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
      body.len()
    )
  }

  #[test]
  fn fetch_streams_body_and_reports_length() {
    let (base, server) = serve(vec![ok("BRANCH=stable\n")]);
    let transport = HttpTransport::new(Duration::from_secs(5), Duration::from_secs(5));
    let mut sink = BufferSink::default();
    transport.fetch(&endpoint(&base, "/stable.manifest"), &mut sink).unwrap();

    assert_eq!(sink.data, b"BRANCH=stable\n");
    assert_eq!(sink.content_length, Some(14));
    assert!(sink.finished);

    let requests = server.join().unwrap();
    assert!(requests[0].starts_with("GET /stable.manifest HTTP/1.1"));
    assert!(requests[0].to_ascii_lowercase().contains("user-agent: autoupdater/"));
  }

  #[test]
  fn non_200_status_is_an_error() {
    let (base, server) = serve(vec![
      "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    ]);
    let transport = HttpTransport::default();
    let mut sink = BufferSink::default();
    let err = transport.fetch(&endpoint(&base, "/missing"), &mut sink).unwrap_err();
    assert!(format!("{err:#}").contains("404"));
    assert!(!sink.finished);
    server.join().unwrap();
  }

  #[test]
  fn redirects_are_followed() {
    let (base, server) = serve(vec![
      "HTTP/1.1 302 Found\r\nLocation: /real\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
      ok("payload"),
    ]);
    let transport = HttpTransport::default();
    let mut sink = BufferSink::default();
    transport.fetch(&endpoint(&base, "/moved"), &mut sink).unwrap();
    assert_eq!(sink.data, b"payload");
    let requests = server.join().unwrap();
    assert!(requests[1].starts_with("GET /real "));
  }

  #[test]
  fn probe_uses_head() {
    let (base, server) = serve(vec![
      "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\n".to_string(),
    ]);
    HttpTransport::default().probe(&endpoint(&base, "/image.bin")).unwrap();
    let requests = server.join().unwrap();
    assert!(requests[0].starts_with("HEAD /image.bin "));
  }

  #[test]
  fn sink_error_aborts_the_transfer() {
    let (base, server) = serve(vec![ok("0123456789")]);
    let mut sink = BufferSink::with_limit(4);
    let err = HttpTransport::default().fetch(&endpoint(&base, "/x"), &mut sink).unwrap_err();
    assert!(format!("{err:#}").contains("max size"));
    assert!(!sink.finished);
    server.join().unwrap();
  }
}
