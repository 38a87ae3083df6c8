use crate::crypto::{Digest, HashState, ManifestSignature, DIGEST_LEN};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Longest accepted manifest line, excluding the newline.
pub const MAX_LINE_LENGTH: usize = 512;

const SIGNATURE_SEPARATOR: &str = "---";

/// A manifest as assembled line by line from an untrusted mirror.
///
/// Nothing here is trustworthy until [`Manifest::signed_digest`] has been
/// checked against the configured keys and [`Manifest::check_fields`]
/// passed.
#[derive(Debug, Default)]
pub struct Manifest {
  pub version: String,
  pub date: Option<DateTime<Utc>>,
  pub priority: f64,
  pub image_filename: String,
  pub image_size: Option<u64>,
  pub image_hash: [u8; DIGEST_LEN],
  pub signatures: Vec<ManifestSignature>,

  pub date_ok: bool,
  pub priority_ok: bool,
  pub branch_ok: bool,
  pub model_ok: bool,

  separator_seen: bool,
  hash: HashState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRejection {
  MissingMandatoryFields,
  WrongBranch,
  NoMatchingImage,
}

impl std::fmt::Display for FieldRejection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let text = match self {
      FieldRejection::MissingMandatoryFields => "manifest is missing mandatory fields",
      FieldRejection::WrongBranch => "manifest is not for the requested branch",
      FieldRejection::NoMatchingImage => "no matching image for this hardware",
    };
    f.write_str(text)
  }
}

impl Manifest {
  pub fn new() -> Self {
    Self::default()
  }

  /// Digest of everything above the `---` separator, newline-terminated.
  pub fn signed_digest(&self) -> Digest {
    self.hash.clone().finalize()
  }

  /// Flag gate applied after the signature threshold. The order of the
  /// checks decides which rejection is reported.
  pub fn check_fields(&self) -> Result<(), FieldRejection> {
    if !self.date_ok || !self.priority_ok {
      return Err(FieldRejection::MissingMandatoryFields);
    }
    if !self.branch_ok {
      return Err(FieldRejection::WrongBranch);
    }
    if !self.model_ok {
      return Err(FieldRejection::NoMatchingImage);
    }
    Ok(())
  }
}

/// Feeds one manifest record into `m`.
pub fn parse_line(line: &str, m: &mut Manifest, branch: &str, local_image_name: &str) {
  if m.separator_seen {
    match ManifestSignature::from_hex(line) {
      Ok(sig) => m.signatures.push(sig),
      Err(e) => tracing::debug!(error = %e, "ignoring malformed signature line"),
    }
    return;
  }

  if line == SIGNATURE_SEPARATOR {
    m.separator_seen = true;
    return;
  }

  m.hash.update(line.as_bytes());
  m.hash.update(b"\n");

  if let Some(value) = line.strip_prefix("BRANCH=") {
    if value == branch {
      m.branch_ok = true;
    }
  } else if let Some(value) = line.strip_prefix("DATE=") {
    if let Some(date) = parse_date(value) {
      m.date = Some(date);
      m.date_ok = true;
    }
  } else if let Some(value) = line.strip_prefix("PRIORITY=") {
    if let Ok(prio) = value.trim().parse::<f64>() {
      if prio.is_finite() && prio >= 0.0 {
        m.priority = prio;
        m.priority_ok = true;
      }
    }
  } else if !m.model_ok {
    parse_image_line(line, m, local_image_name);
  }
}

fn parse_image_line(line: &str, m: &mut Manifest, local_image_name: &str) {
  let fields: Vec<&str> = line.split_whitespace().collect();
  let (model, version, checksum, size, filename) = match fields.as_slice() {
    [model, version, checksum, size, filename] => (*model, *version, *checksum, Some(*size), *filename),
    [model, version, checksum, filename] => (*model, *version, *checksum, None, *filename),
    _ => return,
  };

  if model != local_image_name {
    return;
  }

  let mut hash = [0u8; DIGEST_LEN];
  if hex::decode_to_slice(checksum, &mut hash).is_err() {
    tracing::debug!(model, "ignoring image line with malformed checksum");
    return;
  }

  let image_size = match size.map(str::parse::<u64>) {
    None => None,
    Some(Ok(s)) => Some(s),
    Some(Err(_)) => {
      tracing::debug!(model, "ignoring image line with malformed size");
      return;
    }
  };

  m.version = version.to_string();
  m.image_hash = hash;
  m.image_size = image_size;
  m.image_filename = filename.to_string();
  m.model_ok = true;
}

/// Accepts RFC 3339 timestamps with `T` or a space between date and time,
/// optionally without seconds or offset, and plain dates. Offset-less
/// values are taken as UTC.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
  let text = text.trim();

  if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
    return Some(dt.with_timezone(&Utc));
  }
  for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M%:z", "%Y-%m-%dT%H:%M%:z"] {
    if let Ok(dt) = DateTime::parse_from_str(text, fmt) {
      return Some(dt.with_timezone(&Utc));
    }
  }
  for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M"] {
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
      return Some(naive.and_utc());
    }
  }
  NaiveDate::parse_from_str(text, "%Y-%m-%d")
    .ok()
    .and_then(|d| d.and_hms_opt(0, 0, 0))
    .map(|naive| naive.and_utc())
}

#[derive(Debug, thiserror::Error)]
pub enum LineError {
  #[error("manifest line exceeds limit of {} characters", MAX_LINE_LENGTH)]
  TooLong,
  #[error("manifest line is not valid UTF-8")]
  Encoding,
}

/// Chops a byte stream into bounded lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
  buf: Vec<u8>,
}

impl LineSplitter {
  pub fn new() -> Self {
    Self { buf: Vec::with_capacity(MAX_LINE_LENGTH) }
  }

  /// Calls `on_line` for every complete line in `chunk`. Bytes after the
  /// last newline are kept for the next call.
  pub fn push(&mut self, chunk: &[u8], mut on_line: impl FnMut(&str)) -> Result<(), LineError> {
    let mut rest = chunk;
    while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
      self.extend(&rest[..pos])?;
      emit(&self.buf, &mut on_line)?;
      self.buf.clear();
      rest = &rest[pos + 1..];
    }
    self.extend(rest)
  }

  /// Flushes a final unterminated line, if any.
  pub fn finish(&mut self, mut on_line: impl FnMut(&str)) -> Result<(), LineError> {
    if self.buf.is_empty() {
      return Ok(());
    }
    let res = emit(&self.buf, &mut on_line);
    self.buf.clear();
    res
  }

  fn extend(&mut self, bytes: &[u8]) -> Result<(), LineError> {
    if self.buf.len() + bytes.len() > MAX_LINE_LENGTH {
      return Err(LineError::TooLong);
    }
    self.buf.extend_from_slice(bytes);
    Ok(())
  }
}

fn emit(buf: &[u8], on_line: &mut impl FnMut(&str)) -> Result<(), LineError> {
  let line = std::str::from_utf8(buf).map_err(|_| LineError::Encoding)?;
  on_line(line.strip_suffix('\r').unwrap_or(line));
  Ok(())
}
