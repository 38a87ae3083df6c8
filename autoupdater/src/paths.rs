use std::path::PathBuf;

pub fn default_config_path() -> PathBuf {
  PathBuf::from("/etc/autoupdater.toml")
}

pub fn default_lock_file() -> PathBuf {
  PathBuf::from("/var/lock/autoupdater.lock")
}

pub fn default_firmware_file() -> PathBuf {
  PathBuf::from("/tmp/firmware.bin")
}

pub fn default_sysupgrade() -> PathBuf {
  PathBuf::from("/sbin/sysupgrade")
}

pub fn default_hooks_dir() -> PathBuf {
  PathBuf::from("/usr/lib/autoupdater")
}

pub fn default_release_file() -> PathBuf {
  PathBuf::from("/lib/gluon/release")
}

pub fn default_image_name_file() -> PathBuf {
  PathBuf::from("/tmp/sysinfo/image_name")
}

pub fn default_proxy_lock_file() -> PathBuf {
  PathBuf::from("/tmp/fwproxy.lock")
}
