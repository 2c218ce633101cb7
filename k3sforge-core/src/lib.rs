//! k3sforge core library
//!
//! Bootstraps a k3s cluster on Lima VMs spread over SSH-reachable hosts:
//! one master, then any number of workers joined to it in parallel.

pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod orchestrator;
pub mod probe;
pub mod scripts;
pub mod secrets;
pub mod state;
pub mod task;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{ClusterConfig, ConfigError, ProvisionSettings};
pub use error::{ProvisionError, ProvisionResult};
pub use executor::{CommandOutput, HostConnection, RemoteExecutor, SshExecutor};
pub use logging::LoggingConfig;
pub use orchestrator::{ClusterOrchestrator, TaskSummary};
pub use probe::ReadinessProbe;
pub use secrets::{EnvSecretProvider, SecretBundle, SecretProvider, StaticSecretProvider};
pub use state::{ClusterOutputs, ClusterState, StateFile, TeardownReport};
pub use task::{ProvisioningTask, TaskState};
