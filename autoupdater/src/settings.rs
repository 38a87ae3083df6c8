use crate::cli::Args;
use crate::config::Config;
use crate::crypto::PublicKey;
use std::collections::BTreeSet;

/// Everything one run needs to decide on and verify an update. Built once
/// at startup and not changed afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
  /// Branch name expected in the manifest.
  pub branch: String,
  pub force: bool,
  pub force_version: bool,
  pub fallback: bool,
  pub no_action: bool,
  pub old_version: String,
  pub pubkeys: BTreeSet<PublicKey>,
  pub required_good_signatures: usize,
  pub mirrors: Vec<String>,
  /// Mirrors came from the command line and are tried in order.
  pub mirrors_external: bool,
}

impl Settings {
  pub fn build(cfg: &Config, args: &Args, old_version: String) -> anyhow::Result<Self> {
    let key = args.branch.as_deref().unwrap_or(&cfg.branch);
    let branch = cfg.branch_config(key)?;

    let mut pubkeys = BTreeSet::new();
    for (idx, raw) in branch.pubkeys.iter().enumerate() {
      match PublicKey::from_hex(raw) {
        Ok(pk) => {
          pubkeys.insert(pk);
        }
        Err(e) => {
          tracing::warn!(branch = %key, key_index = idx, error = %format!("{e:#}"), "ignoring invalid public key");
        }
      }
    }

    if branch.good_signatures > pubkeys.len() {
      anyhow::bail!(
        "branch {key}: {} good signatures required but only {} public keys configured",
        branch.good_signatures,
        pubkeys.len()
      );
    }

    let mirrors_external = !args.mirrors.is_empty();
    let mirrors = if mirrors_external {
      args.mirrors.clone()
    } else {
      branch.mirrors.clone()
    };

    Ok(Self {
      branch: branch.name.clone(),
      force: args.force,
      force_version: args.force_version,
      fallback: args.fallback,
      no_action: args.no_action,
      old_version,
      pubkeys,
      required_good_signatures: branch.good_signatures,
      mirrors,
      mirrors_external,
    })
  }
}
