//! Cluster teardown command

use super::Context;
use crate::output::{self, OutputFormat};
use anyhow::Result;
use dialoguer::Confirm;
use k3sforge_core::state::HostTeardown;
use k3sforge_core::StateFile;
use std::process::ExitCode;
use tabled::Tabled;

#[derive(Tabled)]
struct TeardownRow {
    host: String,
    role: String,
    vm: String,
    result: String,
}

impl From<&HostTeardown> for TeardownRow {
    fn from(host: &HostTeardown) -> Self {
        Self {
            host: host.host.clone(),
            role: host.role.to_string(),
            vm: host.resource.clone(),
            result: match &host.error {
                Some(e) => format!("failed: {}", output::truncate(e, 60)),
                None => "deleted".to_string(),
            },
        }
    }
}

pub async fn handle_destroy(ctx: &Context, yes: bool, format: OutputFormat) -> Result<ExitCode> {
    let mut orchestrator = ctx.orchestrator()?;

    if !yes {
        let vms: Vec<String> = orchestrator.plan().into_iter().map(|t| t.resource).collect();
        let confirm = Confirm::new()
            .with_prompt(format!("Delete {} VM(s): {}?", vms.len(), vms.join(", ")))
            .default(false)
            .interact()?;

        if !confirm {
            output::print_info("Aborted");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let spinner = super::spinner("Deleting cluster VMs...".to_string());
    let report = orchestrator.teardown().await;
    spinner.finish_and_clear();

    let rows: Vec<TeardownRow> = report.hosts.iter().map(TeardownRow::from).collect();
    output::print_output(rows, &report, format)?;

    if report.is_clean() {
        StateFile::remove(&ctx.state_path())?;
        output::print_success("Cluster destroyed");
        Ok(ExitCode::SUCCESS)
    } else {
        output::print_warning(&format!(
            "{} host(s) could not be cleaned up; re-run destroy once they are reachable",
            report.failures().count()
        ));
        Ok(ExitCode::FAILURE)
    }
}
