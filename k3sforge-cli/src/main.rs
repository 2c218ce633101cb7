//! k3sforge CLI
//!
//! Bootstrap and tear down a k3s cluster on Lima VMs across SSH-reachable hosts

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use output::OutputFormat;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Cluster config file (defaults to $K3SFORGE_CONFIG, ./k3sforge.toml, ./k3sforge.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (table, json, yaml)
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    /// Log level, overriding the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the master, then every worker
    Up {
        /// Write the cluster kubeconfig to this file (mode 0600)
        #[arg(long)]
        kubeconfig_out: Option<PathBuf>,
        /// Include the kubeconfig in the printed outputs
        #[arg(long)]
        show_secrets: bool,
    },
    /// Delete every worker VM, then the master VM
    Destroy {
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Validate the config and show the task graph without touching any host
    Plan,
    /// Show the outputs saved by the last `up`
    Outputs,
    /// Write a sample config file
    Init {
        /// Destination file
        #[arg(default_value = "k3sforge.toml")]
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Generate shell completions
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let load = || commands::Context::load(cli.config.as_deref(), cli.log_level.as_deref());

    match cli.command {
        Commands::Up {
            kubeconfig_out,
            show_secrets,
        } => {
            let ctx = load()?;
            commands::up::handle_up(&ctx, kubeconfig_out.as_deref(), show_secrets, cli.output).await
        }
        Commands::Destroy { yes } => {
            let ctx = load()?;
            commands::destroy::handle_destroy(&ctx, yes, cli.output).await
        }
        Commands::Plan => commands::plan::handle_plan(&load()?, cli.output),
        Commands::Outputs => commands::outputs::handle_outputs(&load()?, cli.output),
        Commands::Init { path, force } => {
            commands::init::handle_init(&path, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Generate shell completions
fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();

    generate(shell, &mut cmd, name, &mut io::stdout());
}
