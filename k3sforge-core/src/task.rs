//! Provisioning tasks
//!
//! A task owns one host's lifecycle: a create plan that ends in a
//! structured stdout payload, a delete script, and the deadlines for both.
//! Create plans are expected to delete any same-named resource before
//! creating it, so re-running a task is safe; the task itself does not
//! retry.

use crate::error::{ProvisionError, ProvisionResult};
use crate::executor::{HostConnection, RemoteExecutor};
use crate::probe::ReadinessProbe;
use crate::secrets::{MasterPayload, SecretBundle};
use crate::state::NodeDescriptor;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Ceiling for a single readiness check invocation
const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Destroying,
    Destroyed,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Destroying => write!(f, "destroying"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// States of the tasks a run depends on, keyed by task name
pub type UpstreamStates = HashMap<String, TaskState>;

/// One step of a create plan
#[derive(Debug, Clone)]
pub enum Step {
    /// Run a script; a non-zero exit fails the plan
    Run { label: String, script: String },
    /// Poll a check script until it exits 0
    Await {
        label: String,
        check: String,
        probe: ReadinessProbe,
    },
}

impl Step {
    pub fn label(&self) -> &str {
        match self {
            Self::Run { label, .. } | Self::Await { label, .. } => label,
        }
    }
}

/// Ordered steps making up a create action.
///
/// The stdout of the last `Run` step is the task's structured output.
#[derive(Debug, Clone, Default)]
pub struct CreatePlan {
    steps: Vec<Step>,
}

impl CreatePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(mut self, label: &str, script: impl Into<String>) -> Self {
        self.steps.push(Step::Run {
            label: label.to_string(),
            script: script.into(),
        });
        self
    }

    pub fn await_ready(mut self, label: &str, check: impl Into<String>, probe: ReadinessProbe) -> Self {
        self.steps.push(Step::Await {
            label: label.to_string(),
            check: check.into(),
            probe,
        });
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// Typed payload decoded from a create plan's stdout
pub trait TaskOutput: Clone + Send + Sync + Sized + 'static {
    fn decode(host: &str, stdout: &str) -> ProvisionResult<Self>;
}

/// Decode exactly one JSON object of shape `T`, naming `host` on failure
pub fn decode_strict<T: DeserializeOwned>(host: &str, stdout: &str) -> ProvisionResult<T> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(ProvisionError::malformed(host, "empty stdout", stdout));
    }

    serde_json::from_str(trimmed).map_err(|e| ProvisionError::malformed(host, e.to_string(), stdout))
}

fn require_non_empty(host: &str, field: &str, value: &str, stdout: &str) -> ProvisionResult<()> {
    if value.trim().is_empty() {
        return Err(ProvisionError::malformed(
            host,
            format!("field `{}` is empty", field),
            stdout,
        ));
    }
    Ok(())
}

impl TaskOutput for SecretBundle {
    fn decode(host: &str, stdout: &str) -> ProvisionResult<Self> {
        let payload: MasterPayload = decode_strict(host, stdout)?;
        require_non_empty(host, "ip", &payload.ip, stdout)?;
        require_non_empty(host, "token", payload.token.expose(), stdout)?;
        require_non_empty(host, "kubeconfig", payload.kubeconfig.expose(), stdout)?;
        Ok(payload.into())
    }
}

impl TaskOutput for NodeDescriptor {
    fn decode(host: &str, stdout: &str) -> ProvisionResult<Self> {
        let node: NodeDescriptor = decode_strict(host, stdout)?;
        require_non_empty(host, "ip", &node.ip, stdout)?;
        Ok(node)
    }
}

/// Renders the scripts for one kind of host
pub trait HostProvisioner: Send + Sync + 'static {
    /// Values from upstream tasks the create plan needs
    type Input: Send + Sync;
    type Output: TaskOutput;

    fn create_plan(&self, input: &Self::Input) -> CreatePlan;

    fn delete_script(&self) -> String;

    /// Remote resource this provisioner manages, for display
    fn resource_name(&self) -> String;
}

/// Deadlines applied to a task's actions
#[derive(Debug, Clone, Copy)]
pub struct TaskTimeouts {
    pub create: Duration,
    pub delete: Duration,
}

/// One host's create/delete lifecycle
#[derive(Clone)]
pub struct ProvisioningTask<P: HostProvisioner> {
    name: String,
    connection: HostConnection,
    provisioner: P,
    timeouts: TaskTimeouts,
    depends_on: Vec<String>,
    state: TaskState,
    output: Option<P::Output>,
    last_error: Option<String>,
}

impl<P: HostProvisioner> ProvisioningTask<P> {
    pub fn new(
        name: impl Into<String>,
        connection: HostConnection,
        provisioner: P,
        timeouts: TaskTimeouts,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            provisioner,
            timeouts,
            depends_on: Vec::new(),
            state: TaskState::Pending,
            output: None,
            last_error: None,
        }
    }

    pub fn depends_on(mut self, upstream: impl Into<String>) -> Self {
        self.depends_on.push(upstream.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_name(&self) -> &str {
        &self.connection.host_name
    }

    pub fn address(&self) -> &str {
        &self.connection.address
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn output(&self) -> Option<&P::Output> {
        self.output.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn upstream(&self) -> &[String] {
        &self.depends_on
    }

    pub fn timeouts(&self) -> TaskTimeouts {
        self.timeouts
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    fn transition(&mut self, next: TaskState) {
        debug!(task = %self.name, from = %self.state, to = %next, "Task state change");
        self.state = next;
    }

    fn check_upstream(&self, upstream: &UpstreamStates) -> ProvisionResult<()> {
        for dep in &self.depends_on {
            if upstream.get(dep) != Some(&TaskState::Succeeded) {
                return Err(ProvisionError::UpstreamNotReady {
                    task: self.name.clone(),
                    upstream: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Run the create plan and decode its output.
    ///
    /// Every declared upstream must be `Succeeded` in `upstream`. Any
    /// failure leaves the task `Failed` with the error recorded.
    pub async fn run(
        &mut self,
        executor: &dyn RemoteExecutor,
        input: &P::Input,
        upstream: &UpstreamStates,
    ) -> ProvisionResult<P::Output> {
        self.check_upstream(upstream)?;

        if self.state != TaskState::Pending {
            info!(task = %self.name, state = %self.state, "Re-running task");
        }
        self.output = None;
        self.last_error = None;
        self.transition(TaskState::Running);

        let plan = self.provisioner.create_plan(input);
        let result = match tokio::time::timeout(
            self.timeouts.create,
            self.execute_plan(executor, &plan),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::Timeout {
                host: self.connection.address.clone(),
                after: self.timeouts.create,
            }),
        };
        let result = result.and_then(|stdout| P::Output::decode(&self.connection.address, &stdout));

        match result {
            Ok(output) => {
                info!(task = %self.name, host = %self.connection.address, "Task succeeded");
                self.output = Some(output.clone());
                self.transition(TaskState::Succeeded);
                Ok(output)
            }
            Err(e) => {
                error!(task = %self.name, host = %self.connection.address, "Task failed: {}", e);
                self.last_error = Some(e.to_string());
                self.transition(TaskState::Failed);
                Err(e)
            }
        }
    }

    async fn execute_plan(
        &self,
        executor: &dyn RemoteExecutor,
        plan: &CreatePlan,
    ) -> ProvisionResult<String> {
        let deadline = Instant::now() + self.timeouts.create;
        let host = &self.connection.address;
        let mut payload = String::new();

        for step in plan.steps() {
            let remaining = deadline.saturating_duration_since(Instant::now());

            // Scripts may embed the join token, so only labels are logged
            match step {
                Step::Run { label, script } => {
                    info!(task = %self.name, step = %label, "Running step");
                    let output = executor
                        .execute(&self.connection, script, remaining)
                        .await?
                        .into_success(host)?;
                    for line in output.stderr.lines() {
                        debug!(task = %self.name, step = %label, "{}", line);
                    }
                    payload = output.stdout;
                }
                Step::Await {
                    label,
                    check,
                    probe,
                } => {
                    info!(
                        task = %self.name,
                        step = %label,
                        attempts = probe.max_attempts,
                        "Waiting for readiness"
                    );
                    probe
                        .wait_for_command(
                            label,
                            executor,
                            &self.connection,
                            check,
                            remaining.min(CHECK_TIMEOUT),
                        )
                        .await?;
                }
            }
        }

        Ok(payload)
    }

    /// Run the delete script.
    ///
    /// A delete that reports the resource as already gone counts as success.
    /// A failed delete leaves the task `Destroying` with the error recorded,
    /// so it stays distinguishable from a failed create.
    pub async fn teardown(&mut self, executor: &dyn RemoteExecutor) -> ProvisionResult<()> {
        self.transition(TaskState::Destroying);

        let script = self.provisioner.delete_script();
        let result = executor
            .execute(&self.connection, &script, self.timeouts.delete)
            .await
            .and_then(|output| output.into_success(&self.connection.address));

        match result {
            Ok(_) => {}
            Err(e) if e.is_missing_resource() => {
                debug!(task = %self.name, "Nothing to delete: {}", e);
            }
            Err(e) => {
                warn!(task = %self.name, host = %self.connection.address, "Teardown failed: {}", e);
                self.last_error = Some(e.to_string());
                return Err(e);
            }
        }

        self.output = None;
        self.last_error = None;
        self.transition(TaskState::Destroyed);
        info!(task = %self.name, resource = %self.provisioner.resource_name(), "Destroyed");
        Ok(())
    }
}
