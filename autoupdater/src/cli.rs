use clap::Parser;
use std::path::PathBuf;

use crate::paths;

#[derive(Debug, Clone, Parser)]
#[clap(name = "autoupdater", version, about = "Checks for and installs signed firmware updates")]
pub struct Args {
  /// Branch section to use instead of the configured one
  #[clap(short = 'b', long = "branch", value_name = "BRANCH")]
  pub branch: Option<String>,

  /// Ignore the enable switch and the rollout schedule
  #[clap(short = 'f', long = "force", action)]
  pub force: bool,

  /// Download and verify, but do not flash
  #[clap(short = 'n', long = "no-action", action)]
  pub no_action: bool,

  /// Only upgrade if the rollout window has passed by a day
  #[clap(long = "fallback", action)]
  pub fallback: bool,

  /// Install the manifest version even if it is not newer
  #[clap(long = "force-version", action)]
  pub force_version: bool,

  #[clap(long = "config", value_name = "PATH", default_value_os_t = paths::default_config_path())]
  pub config: PathBuf,

  /// Mirrors to try in the given order instead of the configured ones
  #[clap(value_name = "MIRROR")]
  pub mirrors: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let args = Args::try_parse_from(["autoupdater"]).unwrap();
    assert_eq!(args.branch, None);
    assert!(!args.force && !args.no_action && !args.fallback && !args.force_version);
    assert_eq!(args.config, PathBuf::from("/etc/autoupdater.toml"));
    assert!(args.mirrors.is_empty());
  }

  #[test]
  fn flags_and_mirrors() {
    let args = Args::try_parse_from([
      "autoupdater",
      "-b",
      "beta",
      "-f",
      "-n",
      "--fallback",
      "--force-version",
      "--config",
      "/tmp/au.toml",
      "http://a/fw",
      "http://b/fw",
    ])
    .unwrap();
    assert_eq!(args.branch.as_deref(), Some("beta"));
    assert!(args.force && args.no_action && args.fallback && args.force_version);
    assert_eq!(args.config, PathBuf::from("/tmp/au.toml"));
    assert_eq!(args.mirrors, vec!["http://a/fw", "http://b/fw"]);
  }

  #[test]
  fn unknown_flag_is_rejected() {
    assert!(Args::try_parse_from(["autoupdater", "--bogus"]).is_err());
  }
}
