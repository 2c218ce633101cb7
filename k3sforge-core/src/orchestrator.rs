//! Cluster orchestration
//!
//! The task graph is fixed: one master task, then every worker task in
//! parallel, each worker depending only on the master. A failed master
//! aborts the run before any worker starts; failed workers are collected
//! into the resulting [`ClusterState`].

use crate::config::ProvisionSettings;
use crate::error::{ProvisionError, ProvisionResult};
use crate::executor::{HostConnection, RemoteExecutor};
use crate::scripts::{MasterProvisioner, ScriptRenderer, WorkerProvisioner};
use crate::secrets::SecretProvider;
use crate::state::{ClusterState, HostTeardown, JoinedWorker, TeardownReport, WorkerFailure};
use crate::task::{HostProvisioner, ProvisioningTask, TaskState, TaskTimeouts, UpstreamStates};
use chrono::Utc;
use k3sforge_common::{ClusterSpec, HostSpec, NodeRole};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub const MASTER_TASK_NAME: &str = "provision-master-node";

pub fn worker_task_name(host: &HostSpec) -> String {
    format!("provision-worker-{}", host.name)
}

/// One node of the task graph, for display
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task: String,
    pub role: NodeRole,
    pub host: String,
    pub address: String,
    pub resource: String,
    pub depends_on: Vec<String>,
    pub timeout_secs: u64,
    pub state: TaskState,
}

fn summarize<P: HostProvisioner>(task: &ProvisioningTask<P>, role: NodeRole) -> TaskSummary {
    TaskSummary {
        task: task.name().to_string(),
        role,
        host: task.host_name().to_string(),
        address: task.address().to_string(),
        resource: task.provisioner().resource_name(),
        depends_on: task.upstream().to_vec(),
        timeout_secs: task.timeouts().create.as_secs(),
        state: task.state(),
    }
}

/// Drives the master and worker tasks of one cluster
pub struct ClusterOrchestrator {
    spec: ClusterSpec,
    executor: Arc<dyn RemoteExecutor>,
    master: ProvisioningTask<MasterProvisioner>,
    workers: Vec<ProvisioningTask<WorkerProvisioner>>,
    state: Option<ClusterState>,
}

impl ClusterOrchestrator {
    /// Validate the topology and resolve every host's credential.
    ///
    /// All missing credentials are reported together, and nothing is
    /// executed remotely.
    pub fn new(
        spec: ClusterSpec,
        settings: &ProvisionSettings,
        secrets: &dyn SecretProvider,
        executor: Arc<dyn RemoteExecutor>,
    ) -> ProvisionResult<Self> {
        spec.validate()?;

        let mut connections = Vec::new();
        let mut missing = Vec::new();
        for (_, host) in spec.hosts() {
            match secrets.resolve(&host.name) {
                Ok(credential) => connections.push(HostConnection {
                    host_name: host.name.clone(),
                    address: host.address.clone(),
                    user: spec.ssh_user.clone(),
                    port: settings.ssh_port,
                    credential,
                }),
                Err(_) => missing.push(secrets.describe(&host.name)),
            }
        }

        if !missing.is_empty() {
            return Err(ProvisionError::Configuration(format!(
                "Missing credentials: {}",
                missing.join(", ")
            )));
        }

        let renderer = ScriptRenderer::new(settings.clone());
        let mut connections = connections.into_iter();
        let master_connection = connections.next().ok_or_else(|| {
            ProvisionError::Configuration("Cluster has no master host".to_string())
        })?;

        let master = ProvisioningTask::new(
            MASTER_TASK_NAME,
            master_connection,
            MasterProvisioner::new(renderer.clone(), &spec.master),
            TaskTimeouts {
                create: settings.master_timeout(),
                delete: settings.delete_timeout(),
            },
        );

        let workers = spec
            .workers
            .iter()
            .zip(connections)
            .map(|(host, connection)| {
                ProvisioningTask::new(
                    worker_task_name(host),
                    connection,
                    WorkerProvisioner::new(renderer.clone(), host),
                    TaskTimeouts {
                        create: settings.worker_timeout(),
                        delete: settings.delete_timeout(),
                    },
                )
                .depends_on(MASTER_TASK_NAME)
            })
            .collect();

        Ok(Self {
            spec,
            executor,
            master,
            workers,
            state: None,
        })
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    /// Last successful provisioning result, cleared by teardown
    pub fn state(&self) -> Option<&ClusterState> {
        self.state.as_ref()
    }

    pub fn master_task(&self) -> &ProvisioningTask<MasterProvisioner> {
        &self.master
    }

    pub fn worker_tasks(&self) -> &[ProvisioningTask<WorkerProvisioner>] {
        &self.workers
    }

    /// The task graph in execution order
    pub fn plan(&self) -> Vec<TaskSummary> {
        std::iter::once(summarize(&self.master, NodeRole::Master))
            .chain(self.workers.iter().map(|w| summarize(w, NodeRole::Worker)))
            .collect()
    }

    /// Provision the master, then all workers concurrently
    pub async fn provision(&mut self) -> ProvisionResult<&ClusterState> {
        self.state = None;
        info!(
            master = %self.spec.master.address,
            workers = self.workers.len(),
            "Provisioning cluster"
        );

        let bundle = self
            .master
            .run(self.executor.as_ref(), &(), &UpstreamStates::new())
            .await?;

        let mut upstream = UpstreamStates::new();
        upstream.insert(self.master.name().to_string(), self.master.state());
        let join = bundle.join_info();

        let mut join_set = JoinSet::new();
        for (index, task) in self.workers.iter().enumerate() {
            let mut task = task.clone();
            let executor = Arc::clone(&self.executor);
            let join = join.clone();
            let upstream = upstream.clone();

            join_set.spawn(async move {
                let result = task.run(executor.as_ref(), &join, &upstream).await;
                (index, task, result)
            });
        }

        let mut results: Vec<Option<ProvisionResult<String>>> =
            (0..self.workers.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, task, result)) => {
                    results[index] = Some(result.map(|node| node.ip));
                    self.workers[index] = task;
                }
                Err(e) => error!("Worker task aborted: {}", e),
            }
        }

        let mut workers = Vec::new();
        let mut failures = Vec::new();
        for (task, result) in self.workers.iter().zip(results) {
            match result {
                Some(Ok(address)) => workers.push(JoinedWorker {
                    name: task.host_name().to_string(),
                    address,
                }),
                Some(Err(e)) => failures.push(WorkerFailure {
                    name: task.host_name().to_string(),
                    error: e.to_string(),
                }),
                None => failures.push(WorkerFailure {
                    name: task.host_name().to_string(),
                    error: "worker task aborted before completion".to_string(),
                }),
            }
        }

        if failures.is_empty() {
            info!(workers = workers.len(), "Cluster provisioned");
        } else {
            warn!(
                joined = workers.len(),
                failed = failures.len(),
                "Cluster provisioned with failed workers"
            );
        }

        let state = ClusterState {
            master_address: bundle.ip.clone(),
            workers,
            failures,
            credentials: bundle,
            provisioned_at: Utc::now(),
        };
        Ok(&*self.state.insert(state))
    }

    /// Delete every worker VM concurrently, then the master VM.
    ///
    /// Failures are logged and reported; they never stop the remaining deletes.
    pub async fn teardown(&mut self) -> TeardownReport {
        info!(workers = self.workers.len(), "Tearing down cluster");

        let mut join_set = JoinSet::new();
        for (index, task) in self.workers.iter().enumerate() {
            let mut task = task.clone();
            let executor = Arc::clone(&self.executor);

            join_set.spawn(async move {
                let result = task.teardown(executor.as_ref()).await;
                (index, task, result)
            });
        }

        let mut errors: Vec<Option<Option<String>>> = (0..self.workers.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, task, result)) => {
                    errors[index] = Some(result.err().map(|e| e.to_string()));
                    self.workers[index] = task;
                }
                Err(e) => error!("Worker teardown aborted: {}", e),
            }
        }

        let mut report = TeardownReport::default();
        for (task, error) in self.workers.iter().zip(errors) {
            report.hosts.push(HostTeardown {
                host: task.host_name().to_string(),
                role: NodeRole::Worker,
                resource: task.provisioner().resource_name(),
                error: error.unwrap_or_else(|| Some("teardown aborted before completion".to_string())),
            });
        }

        let master_result = self.master.teardown(self.executor.as_ref()).await;
        report.hosts.push(HostTeardown {
            host: self.master.host_name().to_string(),
            role: NodeRole::Master,
            resource: self.master.provisioner().resource_name(),
            error: master_result.err().map(|e| e.to_string()),
        });

        for failed in report.failures() {
            warn!(host = %failed.host, "Teardown incomplete: {}", failed.error.as_deref().unwrap_or_default());
        }

        self.state = None;
        report
    }
}
