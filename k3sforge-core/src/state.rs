//! Aggregated orchestration results

use crate::secrets::SecretBundle;
use chrono::{DateTime, Utc};
use k3sforge_common::{NodeRole, REDACTED};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What a worker's create script reports once joined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDescriptor {
    pub ip: String,
}

/// A worker that joined the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinedWorker {
    pub name: String,
    pub address: String,
}

/// A worker whose provisioning failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFailure {
    pub name: String,
    pub error: String,
}

/// Result of a provisioning run
///
/// Only exists once the master succeeded. Worker lists follow the input
/// order of the cluster config, not completion order.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterState {
    pub master_address: String,
    pub workers: Vec<JoinedWorker>,
    pub failures: Vec<WorkerFailure>,
    pub credentials: SecretBundle,
    pub provisioned_at: DateTime<Utc>,
}

impl ClusterState {
    pub fn worker_addresses(&self) -> Vec<String> {
        self.workers.iter().map(|w| w.address.clone()).collect()
    }

    /// True when every worker joined
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Outputs for display or export; the kubeconfig stays redacted unless `reveal`
    pub fn export(&self, reveal: bool) -> ClusterOutputs {
        let kubeconfig = if reveal {
            self.credentials.kubeconfig.expose().clone()
        } else {
            REDACTED.to_string()
        };

        ClusterOutputs {
            master_node_ip: self.master_address.clone(),
            worker_node_ips: self.worker_addresses(),
            kubeconfig,
        }
    }
}

/// Exported view of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterOutputs {
    #[serde(rename = "masterNodeIP")]
    pub master_node_ip: String,
    #[serde(rename = "workerNodeIPs")]
    pub worker_node_ips: Vec<String>,
    pub kubeconfig: String,
}

/// Outcome of tearing down one host
#[derive(Debug, Clone, Serialize)]
pub struct HostTeardown {
    pub host: String,
    pub role: NodeRole,
    pub resource: String,
    pub error: Option<String>,
}

/// Best-effort teardown summary; errors never stop the remaining deletes
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub hosts: Vec<HostTeardown>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.hosts.iter().all(|h| h.error.is_none())
    }

    pub fn failures(&self) -> impl Iterator<Item = &HostTeardown> {
        self.hosts.iter().filter(|h| h.error.is_some())
    }
}

/// Non-secret part of the last cluster state, persisted between invocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    pub master_address: String,
    pub workers: Vec<JoinedWorker>,
    #[serde(default)]
    pub failures: Vec<WorkerFailure>,
    pub provisioned_at: DateTime<Utc>,
}

impl From<&ClusterState> for StateFile {
    fn from(state: &ClusterState) -> Self {
        Self {
            master_address: state.master_address.clone(),
            workers: state.workers.clone(),
            failures: state.failures.clone(),
            provisioned_at: state.provisioned_at,
        }
    }
}

impl StateFile {
    /// `<dir>/.k3sforge/state.json`
    pub fn default_path(dir: &Path) -> PathBuf {
        dir.join(".k3sforge").join("state.json")
    }

    pub fn load(path: &Path) -> std::io::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn remove(path: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
