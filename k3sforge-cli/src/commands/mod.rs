pub mod destroy;
pub mod init;
pub mod outputs;
pub mod plan;
pub mod up;

use anyhow::{anyhow, Result};
use indicatif::{ProgressBar, ProgressStyle};
use k3sforge_core::logging::WorkerGuard;
use k3sforge_core::{
    ClusterConfig, ClusterOrchestrator, ConfigError, EnvSecretProvider, SshExecutor, StateFile,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;

/// Loaded config plus the logging guard, held for the whole command
pub struct Context {
    pub config: ClusterConfig,
    pub config_path: PathBuf,
    _log_guard: Option<WorkerGuard>,
}

impl Context {
    pub fn load(config: Option<&Path>, log_level: Option<&str>) -> Result<Self> {
        let config_path = match config {
            Some(path) => path.to_path_buf(),
            None => ClusterConfig::find_config_file().ok_or(ConfigError::NotFound)?,
        };

        let mut config = ClusterConfig::load(Some(&config_path))?;
        if let Some(level) = log_level {
            config.logging.level = level.to_string();
        }

        let guard = config
            .logging
            .init()
            .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;
        tracing::debug!("Loaded config from {}", config_path.display());

        Ok(Self {
            config,
            config_path,
            _log_guard: guard,
        })
    }

    pub fn state_path(&self) -> PathBuf {
        state_path_for(&self.config_path)
    }

    /// Orchestrator over ssh, with keys from `<HOST>_PRIVATE_KEY`
    pub fn orchestrator(&self) -> Result<ClusterOrchestrator> {
        let spec = self.config.cluster_spec()?;
        let executor = Arc::new(SshExecutor::new(self.config.provision.connect_timeout()));
        let orchestrator =
            ClusterOrchestrator::new(spec, &self.config.provision, &EnvSecretProvider, executor)?;
        Ok(orchestrator)
    }
}

/// State lives next to the config file
fn state_path_for(config_path: &Path) -> PathBuf {
    let dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    StateFile::default_path(dir)
}

pub fn spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

#[derive(Tabled)]
pub struct NodeRow {
    role: String,
    name: String,
    address: String,
    status: String,
}

impl NodeRow {
    pub fn new(role: &str, name: &str, address: &str, status: &str) -> Self {
        Self {
            role: role.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            status: status.to_string(),
        }
    }
}
