//! Provisioning error types
//!
//! One variant per failure class an orchestration run can hit. Whether an
//! error aborts the whole run is decided by the orchestrator, not here:
//! anything raised by the master task is fatal, worker errors are collected.

use std::time::Duration;
use thiserror::Error;

/// Provisioning errors
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Missing credential or malformed topology; raised before any remote action
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote channel could not reach the host
    #[error("Connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    /// A bounded readiness poll ran out of attempts
    #[error("'{check}' not ready after {attempts} attempts ({elapsed:?})")]
    ReadinessTimeout {
        check: String,
        attempts: u32,
        elapsed: Duration,
    },

    /// The remote script exited non-zero
    #[error("Remote command on {host} exited with status {exit_code}: {stderr}")]
    RemoteExecution {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    /// The script ran but its stdout broke the output contract
    #[error("Malformed output from {host}: {reason}; raw stdout: {stdout:?}")]
    MalformedOutput {
        host: String,
        reason: String,
        stdout: String,
    },

    /// A create or delete action overran its deadline
    #[error("Operation on {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    /// run() was called before the task's dependencies succeeded
    #[error("Task '{task}' cannot start: upstream '{upstream}' has not succeeded")]
    UpstreamNotReady { task: String, upstream: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    /// Whether a failed delete only reported that the resource is already gone
    pub fn is_missing_resource(&self) -> bool {
        match self {
            // limactl: `instance "<name>" does not exist`, exit 1
            Self::RemoteExecution {
                exit_code: 1,
                stderr,
                ..
            } => stderr.to_lowercase().contains("does not exist"),
            _ => false,
        }
    }

    pub fn malformed(host: &str, reason: impl Into<String>, stdout: &str) -> Self {
        Self::MalformedOutput {
            host: host.to_string(),
            reason: reason.into(),
            stdout: stdout.to_string(),
        }
    }
}

impl From<k3sforge_common::Error> for ProvisionError {
    fn from(err: k3sforge_common::Error) -> Self {
        match err {
            k3sforge_common::Error::Io(e) => ProvisionError::Io(e),
            other => ProvisionError::Configuration(other.to_string()),
        }
    }
}

impl From<ProvisionError> for k3sforge_common::Error {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Configuration(msg) => k3sforge_common::Error::InvalidConfig(msg),
            ProvisionError::Io(e) => k3sforge_common::Error::Io(e),
            other => k3sforge_common::Error::System(other.to_string()),
        }
    }
}

/// Result type alias for provisioning operations
pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_resource_classification() {
        let gone = ProvisionError::RemoteExecution {
            host: "10.0.0.2".to_string(),
            exit_code: 1,
            stderr: "level=fatal msg=\"instance \\\"k3s-mac2\\\" does not exist\"".to_string(),
        };
        assert!(gone.is_missing_resource());

        let other = ProvisionError::RemoteExecution {
            host: "10.0.0.2".to_string(),
            exit_code: 1,
            stderr: "permission denied".to_string(),
        };
        assert!(!other.is_missing_resource());

        let no_limactl = ProvisionError::RemoteExecution {
            host: "10.0.0.2".to_string(),
            exit_code: 127,
            stderr: "bash: line 1: /opt/homebrew/bin/limactl: No such file or directory".to_string(),
        };
        assert!(!no_limactl.is_missing_resource());

        let command_not_found = ProvisionError::RemoteExecution {
            host: "10.0.0.2".to_string(),
            exit_code: 1,
            stderr: "limactl: command not found".to_string(),
        };
        assert!(!command_not_found.is_missing_resource());

        let timeout = ProvisionError::Timeout {
            host: "10.0.0.2".to_string(),
            after: Duration::from_secs(1),
        };
        assert!(!timeout.is_missing_resource());
    }

    #[test]
    fn test_malformed_output_carries_raw_stdout() {
        let err = ProvisionError::malformed("10.0.0.1", "missing field `token`", "{\"ip\":\"x\"}");
        assert!(err.to_string().contains("{\\\"ip\\\":\\\"x\\\"}"));
    }

    #[test]
    fn test_common_error_conversion() {
        let err: ProvisionError = k3sforge_common::Error::Validation("bad".to_string()).into();
        assert!(matches!(err, ProvisionError::Configuration(_)));

        let back: k3sforge_common::Error = ProvisionError::Configuration("x".to_string()).into();
        assert!(matches!(back, k3sforge_common::Error::InvalidConfig(_)));
    }
}
