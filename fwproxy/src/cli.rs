use clap::Parser;
use std::path::PathBuf;

use autoupdater::paths;

#[derive(Debug, Clone, Parser)]
#[clap(name = "fwproxy", version, about = "Relays firmware files from upstream mirrors to mesh neighbours")]
pub struct Args {
  #[clap(long = "config", value_name = "PATH", default_value_os_t = paths::default_config_path())]
  pub config: PathBuf,
}
