use crate::output;
use anyhow::{bail, Context, Result};
use k3sforge_core::secrets::credential_env_var;
use k3sforge_core::ClusterConfig;
use std::path::Path;

/// Write a sample config to `path`
pub fn handle_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    std::fs::write(path, ClusterConfig::generate_sample())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    output::print_success(&format!("Sample config written to {}", path.display()));
    output::print_info(&format!(
        "Each host's SSH private key is read from <HOST>_PRIVATE_KEY, e.g. {}",
        credential_env_var("mac1")
    ));
    Ok(())
}
