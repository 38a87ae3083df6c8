use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Exclusive advisory lock held for the lifetime of an updater run.
///
/// The descriptor is opened close-on-exec; [`RunLock::set_inheritable`]
/// lets it survive into the flashing tool so the lock stays held while the
/// upgrade runs.
#[derive(Debug)]
pub struct RunLock {
  file: File,
  path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
  #[error("another instance is currently running ({})", .0.display())]
  Busy(PathBuf),
  #[error("unable to open lock file {}: {source}", .path.display())]
  Open { path: PathBuf, source: io::Error },
  #[error("flock on {}: {source}", .path.display())]
  Flock { path: PathBuf, source: io::Error },
}

impl RunLock {
  /// Takes the lock without waiting.
  pub fn acquire(path: &Path) -> Result<Self, LockError> {
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .mode(0o600)
      .open(path)
      .map_err(|source| LockError::Open {
        path: path.to_path_buf(),
        source,
      })?;

    // SAFETY: the fd belongs to `file`, which is alive for the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
      let err = io::Error::last_os_error();
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(LockError::Busy(path.to_path_buf()));
      }
      return Err(LockError::Flock {
        path: path.to_path_buf(),
        source: err,
      });
    }

    tracing::debug!(path = %path.display(), "run lock acquired");
    Ok(Self {
      file,
      path: path.to_path_buf(),
    })
  }

  /// Records the time of the last successful run.
  pub fn touch(&self) -> anyhow::Result<()> {
    self
      .file
      .set_modified(SystemTime::now())
      .with_context(|| format!("update mtime of {}", self.path.display()))
  }

  /// Clears (`true`) or restores (`false`) close-on-exec on the lock fd.
  pub fn set_inheritable(&self, inheritable: bool) -> io::Result<()> {
    let fd = self.raw_fd();
    // SAFETY: plain fcntl flag manipulation on an fd we own.
    unsafe {
      let flags = libc::fcntl(fd, libc::F_GETFD);
      if flags < 0 {
        return Err(io::Error::last_os_error());
      }
      let flags = if inheritable {
        flags & !libc::FD_CLOEXEC
      } else {
        flags | libc::FD_CLOEXEC
      };
      if libc::fcntl(fd, libc::F_SETFD, flags) < 0 {
        return Err(io::Error::last_os_error());
      }
    }
    Ok(())
  }

  #[cfg(test)]
  pub(crate) fn is_inheritable(&self) -> io::Result<bool> {
    // SAFETY: see `set_inheritable`.
    let flags = unsafe { libc::fcntl(self.raw_fd(), libc::F_GETFD) };
    if flags < 0 {
      return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::FD_CLOEXEC == 0)
  }

  fn raw_fd(&self) -> RawFd {
    self.file.as_raw_fd()
  }
}
