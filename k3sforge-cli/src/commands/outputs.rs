use super::{Context, NodeRow};
use crate::output::{self, OutputFormat};
use anyhow::{bail, Result};
use k3sforge_core::StateFile;
use std::process::ExitCode;

/// Print the state saved by the last `up`
pub fn handle_outputs(ctx: &Context, format: OutputFormat) -> Result<ExitCode> {
    let path = ctx.state_path();
    let Some(saved) = StateFile::load(&path)? else {
        bail!(
            "No saved cluster state at {}; run `k3sforge up` first",
            path.display()
        );
    };

    let mut rows = vec![NodeRow::new("master", &ctx.config.master.name, &saved.master_address, "ready")];
    rows.extend(
        saved
            .workers
            .iter()
            .map(|w| NodeRow::new("worker", &w.name, &w.address, "joined")),
    );
    rows.extend(
        saved
            .failures
            .iter()
            .map(|f| NodeRow::new("worker", &f.name, "-", "failed")),
    );

    output::print_output(rows, &saved, format)?;
    output::print_info(&format!(
        "Provisioned at {}",
        saved.provisioned_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    Ok(ExitCode::SUCCESS)
}
