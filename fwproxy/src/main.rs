use clap::Parser;

fn main() -> anyhow::Result<()> {
  let args = fwproxy::cli::Args::parse();
  fwproxy::run(&args.config)
}
