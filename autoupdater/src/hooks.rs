use crate::lock::RunLock;
use anyhow::Context;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
  /// Before the image download starts.
  Download,
  /// After a download was discarded or a simulated upgrade finished.
  Abort,
  /// Right before handing over to the flashing tool.
  Upgrade,
}

impl HookKind {
  pub fn dir_name(self) -> &'static str {
    match self {
      HookKind::Download => "download.d",
      HookKind::Abort => "abort.d",
      HookKind::Upgrade => "upgrade.d",
    }
  }
}

/// Side effects on the node. Implementations must not panic.
pub trait Actions {
  /// Runs all hooks of `kind`. Hook failures are logged, never returned.
  fn run_hooks(&self, kind: HookKind);

  /// Replaces the running process with the flashing tool. Only returns if
  /// that failed.
  fn commit_upgrade(&self, image: &Path, lock: &RunLock) -> anyhow::Error;
}

#[derive(Debug, Clone)]
pub struct SystemActions {
  pub hooks_dir: PathBuf,
  pub sysupgrade: PathBuf,
}

impl SystemActions {
  pub fn new(hooks_dir: PathBuf, sysupgrade: PathBuf) -> Self {
    Self { hooks_dir, sysupgrade }
  }
}

impl Actions for SystemActions {
  fn run_hooks(&self, kind: HookKind) {
    let dir = self.hooks_dir.join(kind.dir_name());
    for script in list_hooks(&dir) {
      match Command::new(&script).status() {
        Ok(status) if status.success() => {
          tracing::debug!(hook = %script.display(), "hook finished");
        }
        Ok(status) => {
          tracing::warn!(hook = %script.display(), status = %status, "hook failed");
        }
        Err(e) => {
          tracing::warn!(hook = %script.display(), error = %e, "hook could not be started");
        }
      }
    }
  }

  fn commit_upgrade(&self, image: &Path, lock: &RunLock) -> anyhow::Error {
    if let Err(e) = lock.set_inheritable(true) {
      return anyhow::Error::new(e).context("clear close-on-exec on run lock");
    }

    tracing::info!(tool = %self.sysupgrade.display(), image = %image.display(), "starting upgrade");
    let err = Command::new(&self.sysupgrade).arg(image).exec();

    if let Err(e) = lock.set_inheritable(false) {
      tracing::warn!(error = %e, "failed to restore close-on-exec on run lock");
    }
    anyhow::Error::new(err).context(format!("failed to call {}", self.sysupgrade.display()))
  }
}

/// Regular executable files in `dir`, sorted by file name. A missing
/// directory has no hooks.
pub fn list_hooks(dir: &Path) -> Vec<PathBuf> {
  let entries = match fs::read_dir(dir) {
    Ok(e) => e,
    Err(_) => return Vec::new(),
  };

  let mut hooks: Vec<PathBuf> = entries
    .flatten()
    .filter(|entry| is_executable_file(&entry.path()).unwrap_or(false))
    .map(|entry| entry.path())
    .collect();
  hooks.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
  hooks
}

fn is_executable_file(path: &Path) -> anyhow::Result<bool> {
  let md = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
  Ok(md.is_file() && md.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_script(dir: &Path, name: &str, body: &str, mode: u32) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
  }

  #[test]
  fn hooks_are_listed_in_lexicographic_order() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "20-second", "true", 0o755);
    write_script(dir.path(), "10-first", "true", 0o755);
    write_script(dir.path(), "30-not-executable", "true", 0o644);
    fs::create_dir(dir.path().join("15-directory")).unwrap();

    let names: Vec<String> = list_hooks(dir.path())
      .iter()
      .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
      .collect();
    assert_eq!(names, vec!["10-first", "20-second"]);
  }

  #[test]
  fn missing_directory_has_no_hooks() {
    assert!(list_hooks(Path::new("/nonexistent/autoupdater/hooks")).is_empty());
  }

  #[test]
  fn run_hooks_executes_in_order_and_survives_failures() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("abort.d");
    fs::create_dir(&dir).unwrap();
    let log = root.path().join("log");
    let log_s = log.display().to_string();

    write_script(&dir, "10-a", &format!("echo a >> {log_s}"), 0o755);
    write_script(&dir, "20-fail", "exit 3", 0o755);
    write_script(&dir, "30-b", &format!("echo b >> {log_s}"), 0o755);

    let actions = SystemActions::new(root.path().to_path_buf(), PathBuf::from("/bin/false"));
    actions.run_hooks(HookKind::Abort);
    actions.run_hooks(HookKind::Upgrade);

    assert_eq!(fs::read_to_string(&log).unwrap(), "a\nb\n");
  }

  #[test]
  fn failed_exec_returns_error_and_restores_lock_flags() {
    let root = tempfile::tempdir().unwrap();
    let lock = RunLock::acquire(&root.path().join("lock")).unwrap();
    let actions = SystemActions::new(root.path().to_path_buf(), root.path().join("no-such-sysupgrade"));

    let err = actions.commit_upgrade(&root.path().join("firmware.bin"), &lock);
    assert!(format!("{err:#}").contains("no-such-sysupgrade"));
    assert!(!lock.is_inheritable().unwrap());

    // Lock is still held.
    assert!(RunLock::acquire(&root.path().join("lock")).is_err());
  }
}
