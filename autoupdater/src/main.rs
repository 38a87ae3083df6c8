use anyhow::Context;
use clap::Parser;

fn main() -> anyhow::Result<()> {
  let args = autoupdater::cli::Args::parse();
  autoupdater::run(&args).context("autoupdater run failed")
}
