//! Cluster provisioning command

use super::{Context, NodeRow};
use crate::output::{self, OutputFormat};
use anyhow::{Context as _, Result};
use k3sforge_core::StateFile;
use std::path::Path;
use std::process::ExitCode;

/// Exit status when the master is up but some workers failed
const PARTIAL_SUCCESS: u8 = 2;

pub async fn handle_up(
    ctx: &Context,
    kubeconfig_out: Option<&Path>,
    show_secrets: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    let mut orchestrator = ctx.orchestrator()?;
    let spec = orchestrator.spec().clone();

    let spinner = super::spinner(format!(
        "Provisioning master {} and {} worker(s)...",
        spec.master.name,
        spec.workers.len()
    ));
    let result = orchestrator.provision().await.map(|state| state.clone());
    spinner.finish_and_clear();

    let state = match result {
        Ok(state) => state,
        Err(e) => {
            output::print_error("Master provisioning failed; no workers were started");
            return Err(e.into());
        }
    };

    let state_path = ctx.state_path();
    StateFile::from(&state)
        .save(&state_path)
        .with_context(|| format!("Failed to save state to {}", state_path.display()))?;

    if let Some(path) = kubeconfig_out {
        write_kubeconfig(path, state.credentials.kubeconfig.expose())?;
        output::print_success(&format!("Kubeconfig written to {}", path.display()));
    }

    let mut rows = vec![NodeRow::new("master", &spec.master.name, &state.master_address, "ready")];
    for host in &spec.workers {
        let row = match state.workers.iter().find(|w| w.name == host.name) {
            Some(joined) => NodeRow::new("worker", &host.name, &joined.address, "joined"),
            None => NodeRow::new("worker", &host.name, "-", "failed"),
        };
        rows.push(row);
    }

    let outputs = state.export(show_secrets);
    output::print_output(rows, &outputs, format)?;
    if show_secrets && format == OutputFormat::Table {
        println!("{}", outputs.kubeconfig);
    }

    if !state.is_complete() {
        for failure in &state.failures {
            output::print_error(&format!("Worker '{}' failed: {}", failure.name, failure.error));
        }
        output::print_warning(&format!(
            "{} of {} workers joined",
            state.workers.len(),
            spec.workers.len()
        ));
        return Ok(ExitCode::from(PARTIAL_SUCCESS));
    }

    output::print_success(&format!(
        "Cluster ready: master {} with {} worker(s)",
        state.master_address,
        state.workers.len()
    ));
    Ok(ExitCode::SUCCESS)
}

/// Write the kubeconfig readable by the owner only
fn write_kubeconfig(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    // mode() only applies to newly created files
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(contents.as_bytes())?;
    Ok(())
}
