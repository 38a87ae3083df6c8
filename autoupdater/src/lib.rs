pub mod cli;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod hooks;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod neighbour;
pub mod paths;
pub mod rollout;
pub mod settings;
pub mod source;
pub mod system;
pub mod transport;
pub mod updater;

use anyhow::Context;

pub fn run(args: &cli::Args) -> anyhow::Result<()> {
  let cfg = config::load(&args.config)?;

  logging::init(
    &cfg.logging.level,
    cfg.logging.dir.as_deref(),
    cfg.logging.retention_days,
    "autoupdater",
  )?;

  let system = system::OpenWrtSystem::new(cfg.paths.release_file.clone(), cfg.paths.image_name_file.clone());
  let transport = transport::HttpTransport::new(cfg.network.connect_timeout(), cfg.network.fetch_timeout());
  let actions = hooks::SystemActions::new(cfg.paths.hooks_dir.clone(), cfg.paths.sysupgrade.clone());
  let requester = discovery::UdpRequester;
  let env = updater::Collaborators {
    transport: &transport,
    system: &system,
    actions: &actions,
    requester: &requester,
  };

  execute(&cfg, args, env)
}

/// Runs one update check against the given collaborators.
pub fn execute(cfg: &config::Config, args: &cli::Args, env: updater::Collaborators<'_>) -> anyhow::Result<()> {
  if !cfg.enabled && !args.force {
    tracing::info!("autoupdater is disabled; use -f to run anyway");
    return Ok(());
  }

  let Some(image_name) = env.system.image_name() else {
    anyhow::bail!("unsupported hardware model");
  };

  let lock = lock::RunLock::acquire(&cfg.paths.lock_file)?;

  let old_version = env.system.firmware_version()?;
  let settings = settings::Settings::build(cfg, args, old_version).context("invalid configuration")?;

  tracing::info!(
    branch = %settings.branch,
    version = %settings.old_version,
    model = %image_name,
    mirrors = settings.mirrors.len(),
    "starting autoupdater"
  );

  let discovery_params = updater::DiscoveryParams {
    port: cfg.network.respondd_port,
    budget: cfg.network.discovery_timeout(),
    mesh_protocols: cfg.network.mesh_protocols.clone(),
  };

  let outcome = updater::Updater::new(
    &settings,
    env,
    &lock,
    cfg.paths.firmware_file.clone(),
    discovery_params,
    image_name,
  )
  .run()?;
  tracing::info!(outcome = %outcome, "autoupdater finished");

  if let Err(e) = lock.touch() {
    tracing::warn!(error = %format!("{e:#}"), "failed to record run time");
  }
  Ok(())
}
