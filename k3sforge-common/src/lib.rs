//! Common types shared between k3sforge-core and k3sforge-cli

pub mod secret;

pub use secret::{Secret, REDACTED};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Role a host plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// A single SSH-reachable host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    /// Logical host name, also used to derive VM and credential names
    pub name: String,
    /// Address the host is reachable at over SSH
    #[serde(alias = "ip")]
    pub address: String,
}

impl HostSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Topology of the cluster to bootstrap
///
/// Built once from configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// SSH principal used on every host
    pub ssh_user: String,
    /// Coordinator host
    pub master: HostSpec,
    /// Worker hosts, in the order results are reported
    #[serde(default)]
    pub workers: Vec<HostSpec>,
}

impl ClusterSpec {
    /// Every host in the spec, master first
    pub fn hosts(&self) -> impl Iterator<Item = (NodeRole, &HostSpec)> {
        std::iter::once((NodeRole::Master, &self.master))
            .chain(self.workers.iter().map(|w| (NodeRole::Worker, w)))
    }

    /// Name of the Lima VM created for a host
    pub fn vm_name(role: NodeRole, host: &HostSpec) -> String {
        match role {
            NodeRole::Master => "k3s-master".to_string(),
            NodeRole::Worker => format!("k3s-{}", host.name.to_lowercase()),
        }
    }

    /// Check the preconditions orchestration relies on
    pub fn validate(&self) -> Result<()> {
        if self.ssh_user.trim().is_empty() {
            return Err(Error::Validation("ssh_user cannot be empty".to_string()));
        }

        let mut seen = HashSet::new();
        let mut vm_names = HashSet::new();
        for (role, host) in self.hosts() {
            validate_host_name(&host.name)?;

            if host.address.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "{} '{}' has an empty address",
                    role, host.name
                )));
            }

            if !seen.insert(host.name.to_lowercase()) {
                return Err(Error::Validation(format!(
                    "Host name '{}' is used more than once",
                    host.name
                )));
            }

            // "master" as a worker name would collide with the coordinator VM
            if !vm_names.insert(Self::vm_name(role, host)) {
                return Err(Error::Validation(format!(
                    "Worker '{}' maps to a VM name that is already taken",
                    host.name
                )));
            }
        }

        Ok(())
    }
}

fn validate_host_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Validation("Host name cannot be empty".to_string()));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!(
            "Host name '{}' may only contain letters, digits, '-' and '_'",
            name
        )));
    }

    Ok(())
}

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(workers: &[(&str, &str)]) -> ClusterSpec {
        ClusterSpec {
            ssh_user: "admin".to_string(),
            master: HostSpec::new("mac1", "10.0.0.1"),
            workers: workers
                .iter()
                .map(|(name, addr)| HostSpec::new(*name, *addr))
                .collect(),
        }
    }

    #[test]
    fn test_valid_spec() {
        let spec = spec(&[("mac2", "10.0.0.2"), ("mac3", "10.0.0.3")]);
        assert!(spec.validate().is_ok());
        assert_eq!(spec.hosts().count(), 3);
    }

    #[test]
    fn test_duplicate_worker_names_rejected() {
        let spec = spec(&[("mac2", "10.0.0.2"), ("MAC2", "10.0.0.3")]);
        assert!(matches!(spec.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_worker_named_like_master_vm_rejected() {
        let spec = spec(&[("master", "10.0.0.2")]);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_bad_host_names_rejected() {
        assert!(spec(&[("mac 2", "10.0.0.2")]).validate().is_err());
        assert!(spec(&[("", "10.0.0.2")]).validate().is_err());
        assert!(spec(&[("mac2", "")]).validate().is_err());
    }

    #[test]
    fn test_empty_ssh_user_rejected() {
        let mut spec = spec(&[]);
        spec.ssh_user = " ".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_vm_names() {
        let worker = HostSpec::new("Mac2", "10.0.0.2");
        assert_eq!(ClusterSpec::vm_name(NodeRole::Worker, &worker), "k3s-mac2");
        assert_eq!(ClusterSpec::vm_name(NodeRole::Master, &worker), "k3s-master");
    }

    #[test]
    fn test_worker_accepts_ip_alias() {
        let host: HostSpec = serde_json::from_str(r#"{"name":"mac2","ip":"10.0.0.2"}"#).unwrap();
        assert_eq!(host.address, "10.0.0.2");
    }
}
