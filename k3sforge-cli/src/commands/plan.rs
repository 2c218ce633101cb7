use super::Context;
use crate::output::{self, OutputFormat};
use anyhow::Result;
use k3sforge_core::TaskSummary;
use std::process::ExitCode;
use tabled::Tabled;

#[derive(Tabled)]
struct PlanRow {
    task: String,
    host: String,
    address: String,
    vm: String,
    depends_on: String,
    timeout: String,
}

impl From<&TaskSummary> for PlanRow {
    fn from(task: &TaskSummary) -> Self {
        Self {
            task: task.task.clone(),
            host: task.host.clone(),
            address: task.address.clone(),
            vm: task.resource.clone(),
            depends_on: if task.depends_on.is_empty() {
                "-".to_string()
            } else {
                task.depends_on.join(", ")
            },
            timeout: output::format_duration(task.timeout_secs),
        }
    }
}

/// Validate config and credentials, then show the task graph
pub fn handle_plan(ctx: &Context, format: OutputFormat) -> Result<ExitCode> {
    let orchestrator = ctx.orchestrator()?;
    let plan = orchestrator.plan();

    let rows: Vec<PlanRow> = plan.iter().map(PlanRow::from).collect();
    output::print_output(rows, &plan, format)?;
    output::print_info("Config and credentials are valid; no remote commands were run");

    Ok(ExitCode::SUCCESS)
}
