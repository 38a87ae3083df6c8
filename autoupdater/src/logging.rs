use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber: stderr always, plus a daily rolling file
/// named `{file_prefix}.log` under `log_dir` when one is given.
pub fn init(level: &str, log_dir: Option<&Path>, retention_days: u64, file_prefix: &str) -> anyhow::Result<()> {
  let filter = tracing_subscriber::EnvFilter::try_new(level)
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

  let stderr_layer = tracing_subscriber::fmt::layer()
    .with_ansi(false)
    .with_writer(std::io::stderr)
    .with_target(true);

  let file_layer = match log_dir {
    Some(dir) => {
      fs::create_dir_all(dir)?;
      cleanup_old_logs(dir, retention_days, file_prefix)?;

      let file_appender = tracing_appender::rolling::daily(dir, format!("{file_prefix}.log"));
      let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
      let _ = FILE_GUARD.set(guard);

      Some(
        tracing_subscriber::fmt::layer()
          .with_ansi(false)
          .with_writer(file_writer)
          .with_target(true),
      )
    }
    None => None,
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(stderr_layer)
    .with(file_layer)
    .try_init()?;

  Ok(())
}

fn cleanup_old_logs(log_dir: &Path, retention_days: u64, file_prefix: &str) -> anyhow::Result<()> {
  if retention_days == 0 {
    return Ok(());
  }

  let cutoff = SystemTime::now()
    .checked_sub(Duration::from_secs(retention_days.saturating_mul(24 * 60 * 60)))
    .unwrap_or(SystemTime::UNIX_EPOCH);

  let entries = match fs::read_dir(log_dir) {
    Ok(e) => e,
    Err(_) => return Ok(()),
  };

  for entry in entries.flatten() {
    let path: PathBuf = entry.path();
    if !is_own_log_file(&path, file_prefix) {
      continue;
    }

    let modified = match entry.metadata().and_then(|md| md.modified()) {
      Ok(t) => t,
      Err(_) => continue,
    };

    if modified < cutoff {
      let _ = fs::remove_file(&path);
    }
  }

  Ok(())
}

fn is_own_log_file(path: &Path, file_prefix: &str) -> bool {
  let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
    return false;
  };
  let base = format!("{file_prefix}.log");
  name == base || name.starts_with(&format!("{base}."))
}
