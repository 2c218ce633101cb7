//! Configuration management for k3sforge
//!
//! A cluster config is loaded from:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML or YAML, picked by extension)
//! 3. Default values (lowest priority)

use crate::error::ProvisionError;
use crate::logging::LoggingConfig;
use crate::probe::ReadinessProbe;
use k3sforge_common::{ClusterSpec, HostSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cluster configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// SSH principal on every host
    pub ssh_user: String,
    /// Coordinator host
    pub master: HostSpec,
    /// Worker hosts
    #[serde(default)]
    pub workers: Vec<HostSpec>,
    /// Worker list as a JSON string (`[{"name": .., "ip": ..}]`), appended to `workers`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_nodes_json: Option<String>,
    /// Provisioning settings
    #[serde(default)]
    pub provision: ProvisionSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Knobs for the Lima VMs and the k3s install
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionSettings {
    /// Directory holding limactl and jq on the hosts
    pub brew_bin_path: String,
    /// Lima VM type
    pub vm_type: String,
    /// Cloud image the VMs boot from
    pub image_url: String,
    pub image_arch: String,
    /// Clear the Lima image cache before creating a VM
    pub clear_image_cache: bool,
    pub ssh_port: u16,
    pub connect_timeout_secs: u64,
    pub master_timeout_secs: u64,
    pub worker_timeout_secs: u64,
    pub delete_timeout_secs: u64,
    /// Wait for a freshly started VM to accept shell commands
    pub vm_boot: ReadinessProbe,
    /// Wait for k3s to write the node token and kubeconfig
    pub k3s_secrets: ReadinessProbe,
    pub flannel_backend: String,
    pub api_port: u16,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            brew_bin_path: "/opt/homebrew/bin".to_string(),
            vm_type: "vz".to_string(),
            image_url: "https://cloud-images.ubuntu.com/releases/24.04/release/ubuntu-24.04-server-cloudimg-arm64.img".to_string(),
            image_arch: "aarch64".to_string(),
            clear_image_cache: true,
            ssh_port: 22,
            connect_timeout_secs: 10,
            master_timeout_secs: 30 * 60,
            worker_timeout_secs: 25 * 60,
            delete_timeout_secs: 5 * 60,
            vm_boot: ReadinessProbe::new(Duration::from_secs(8), 25),
            k3s_secrets: ReadinessProbe::new(Duration::from_secs(2), 90),
            flannel_backend: "wireguard-native".to_string(),
            api_port: 6443,
        }
    }
}

impl ProvisionSettings {
    pub fn master_timeout(&self) -> Duration {
        Duration::from_secs(self.master_timeout_secs)
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.brew_bin_path.starts_with('/') {
            return Err(ConfigError::Validation(
                "brew_bin_path must be an absolute path".to_string(),
            ));
        }

        if self.ssh_port == 0 || self.api_port == 0 {
            return Err(ConfigError::Validation("Ports cannot be 0".to_string()));
        }

        for (name, secs) in [
            ("master_timeout_secs", self.master_timeout_secs),
            ("worker_timeout_secs", self.worker_timeout_secs),
            ("delete_timeout_secs", self.delete_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Validation(format!("{} cannot be 0", name)));
            }
        }

        for (name, probe) in [("vm_boot", &self.vm_boot), ("k3s_secrets", &self.k3s_secrets)] {
            if probe.max_attempts == 0 {
                return Err(ConfigError::Validation(format!(
                    "{}.max_attempts must be at least 1",
                    name
                )));
            }
        }

        Ok(())
    }
}

impl ClusterConfig {
    /// Load from `path`, or from the first standard location that exists
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::find_config_file().ok_or(ConfigError::NotFound)?,
        };

        let mut config = Self::load_from_file(&path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file without applying overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            _ => toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string())),
        }
    }

    /// Find configuration file in standard locations
    pub fn find_config_file() -> Option<PathBuf> {
        let paths = [
            std::env::var("K3SFORGE_CONFIG").ok().map(PathBuf::from),
            Some(PathBuf::from("./k3sforge.toml")),
            Some(PathBuf::from("./k3sforge.yaml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(user) = var("K3SFORGE_SSH_USER") {
            self.ssh_user = user;
        }
        if let Some(path) = var("K3SFORGE_BREW_BIN") {
            self.provision.brew_bin_path = path;
        }
        if let Some(secs) = var("K3SFORGE_MASTER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.provision.master_timeout_secs = secs;
        }
        if let Some(secs) = var("K3SFORGE_WORKER_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.provision.worker_timeout_secs = secs;
        }

        // Logging
        if let Some(level) = var("K3SFORGE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(dir) = var("K3SFORGE_LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
    }

    /// Worker list with `worker_nodes_json` merged in
    pub fn worker_hosts(&self) -> Result<Vec<HostSpec>, ConfigError> {
        let mut workers = self.workers.clone();
        if let Some(json) = &self.worker_nodes_json {
            let extra: Vec<HostSpec> = serde_json::from_str(json).map_err(|e| {
                ConfigError::Parse(format!("failed to unmarshal worker_nodes_json: {}", e))
            })?;
            workers.extend(extra);
        }
        Ok(workers)
    }

    /// The immutable topology orchestration runs against
    pub fn cluster_spec(&self) -> Result<ClusterSpec, ConfigError> {
        Ok(ClusterSpec {
            ssh_user: self.ssh_user.clone(),
            master: self.master.clone(),
            workers: self.worker_hosts()?,
        })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cluster_spec()?
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        self.provision.validate()
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = Self {
            ssh_user: "admin".to_string(),
            master: HostSpec::new("mac1", "192.168.1.10"),
            workers: vec![
                HostSpec::new("mac2", "192.168.1.11"),
                HostSpec::new("mac3", "192.168.1.12"),
            ],
            worker_nodes_json: None,
            provision: ProvisionSettings::default(),
            logging: LoggingConfig::default(),
        };
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// No config file given or found in the standard locations
    NotFound,
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound => write!(
                f,
                "No config file found (pass --config, set K3SFORGE_CONFIG or create ./k3sforge.toml)"
            ),
            ConfigError::FileRead(path, err) => {
                write!(f, "Failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for ProvisionError {
    fn from(err: ConfigError) -> Self {
        ProvisionError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
ssh_user = "admin"

[master]
name = "mac1"
address = "10.0.0.1"

[[workers]]
name = "mac2"
address = "10.0.0.2"

[provision]
master_timeout_secs = 600

[provision.vm_boot]
interval_secs = 5
max_attempts = 10
"#;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_settings() {
        let settings = ProvisionSettings::default();
        assert_eq!(settings.brew_bin_path, "/opt/homebrew/bin");
        assert_eq!(settings.master_timeout(), Duration::from_secs(1800));
        assert_eq!(settings.worker_timeout(), Duration::from_secs(1500));
        assert_eq!(settings.vm_boot.max_attempts, 25);
        assert_eq!(settings.k3s_secrets.interval, Duration::from_secs(2));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_toml_with_partial_settings() {
        let file = write_config(".toml", SAMPLE);
        let config = ClusterConfig::load_from_file(file.path()).unwrap();

        assert_eq!(config.master.name, "mac1");
        assert_eq!(config.workers.len(), 1);
        assert_eq!(config.provision.master_timeout_secs, 600);
        assert_eq!(config.provision.worker_timeout_secs, 1500);
        assert_eq!(config.provision.vm_boot.max_attempts, 10);
        assert_eq!(config.provision.k3s_secrets.max_attempts, 90);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_yaml_with_worker_json() {
        let yaml = r#"
ssh_user: admin
master:
  name: mac1
  address: 10.0.0.1
worker_nodes_json: '[{"name":"mac2","ip":"10.0.0.2"},{"name":"mac3","ip":"10.0.0.3"}]'
"#;
        let file = write_config(".yaml", yaml);
        let config = ClusterConfig::load(Some(file.path())).unwrap();
        let spec = config.cluster_spec().unwrap();

        let names: Vec<&str> = spec.workers.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["mac2", "mac3"]);
        assert_eq!(spec.workers[1].address, "10.0.0.3");
    }

    #[test]
    fn test_bad_worker_json_is_parse_error() {
        let mut config = ClusterConfig::load_from_file(write_config(".toml", SAMPLE).path()).unwrap();
        config.worker_nodes_json = Some("not json".to_string());
        assert!(matches!(config.cluster_spec(), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_duplicate_workers_fail_validation() {
        let mut config = ClusterConfig::load_from_file(write_config(".toml", SAMPLE).path()).unwrap();
        config.workers.push(HostSpec::new("mac2", "10.0.0.9"));
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = ClusterConfig::load(Some(Path::new("/nonexistent/k3sforge.toml")));
        assert!(matches!(result, Err(ConfigError::FileRead(_, _))));
    }

    #[test]
    fn test_overrides() {
        let mut config = ClusterConfig::load_from_file(write_config(".toml", SAMPLE).path()).unwrap();
        let vars: HashMap<&str, &str> = [
            ("K3SFORGE_SSH_USER", "root"),
            ("K3SFORGE_WORKER_TIMEOUT_SECS", "60"),
            ("K3SFORGE_MASTER_TIMEOUT_SECS", "not-a-number"),
            ("K3SFORGE_LOG_DIR", "/tmp/k3sforge-logs"),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.ssh_user, "root");
        assert_eq!(config.provision.worker_timeout_secs, 60);
        assert_eq!(config.provision.master_timeout_secs, 600);
        assert_eq!(config.logging.log_dir, Some(PathBuf::from("/tmp/k3sforge-logs")));
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = ProvisionSettings::default();
        settings.brew_bin_path = "opt/homebrew/bin".to_string();
        assert!(settings.validate().is_err());

        let mut settings = ProvisionSettings::default();
        settings.worker_timeout_secs = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_generate_sample_config() {
        let sample = ClusterConfig::generate_sample();
        assert!(sample.contains("ssh_user"));
        assert!(sample.contains("[master]"));
        assert!(sample.contains("[[workers]]"));
        assert!(sample.contains("[provision]"));

        let parsed: ClusterConfig = toml::from_str(&sample).unwrap();
        assert!(parsed.validate().is_ok());
    }
}
