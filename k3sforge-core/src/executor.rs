//! Remote command execution
//!
//! The only place k3sforge touches the network. Everything above this
//! module talks to [`RemoteExecutor`] so tests can substitute a scripted
//! implementation.

use crate::error::{ProvisionError, ProvisionResult};
use crate::secrets::Credential;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// ssh reserves this status for its own failures
const SSH_ERROR_EXIT: i32 = 255;

/// Messages the ssh client prints when it cannot reach or log into a host
const SSH_TRANSPORT_ERRORS: &[&str] = &[
    "connect to host",
    "could not resolve hostname",
    "connection closed by",
    "connection reset by",
    "connection timed out",
    "permission denied",
    "no route to host",
];

/// Whether a 255 exit came from our own ssh hop to `address`.
///
/// Remote commands can exit 255 too (`limactl shell` passes through the
/// status of its inner ssh), so the status alone is not enough.
fn is_transport_failure(stderr: &str, address: &str) -> bool {
    stderr.lines().any(|line| {
        let line = line.to_lowercase();
        line.contains(&address.to_lowercase())
            && SSH_TRANSPORT_ERRORS.iter().any(|marker| line.contains(marker))
    })
}

/// Everything needed to reach one host
#[derive(Debug, Clone)]
pub struct HostConnection {
    /// Logical host name from the cluster config
    pub host_name: String,
    pub address: String,
    pub user: String,
    pub port: u16,
    pub credential: Credential,
}

impl HostConnection {
    /// `user@address`, as passed to ssh
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Captured result of one remote invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Structured payload channel
    pub stdout: String,
    /// Human-readable progress; never parsed
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Treat any non-zero exit as a failure, whatever stdout holds
    pub fn into_success(self, host: &str) -> ProvisionResult<CommandOutput> {
        if self.success() {
            Ok(self)
        } else {
            Err(ProvisionError::RemoteExecution {
                host: host.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// Runs shell text on a remote host
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Execute `script` on the host behind `connection`.
    ///
    /// Returns the captured output for any exit status; only failures to
    /// reach the host (`Connection`) or to finish within `timeout`
    /// (`Timeout`) are errors at this level. A timed-out invocation is
    /// cancelled before returning.
    async fn execute(
        &self,
        connection: &HostConnection,
        script: &str,
        timeout: Duration,
    ) -> ProvisionResult<CommandOutput>;
}

/// Executor backed by the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshExecutor {
    ssh_binary: String,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            connect_timeout,
        }
    }

    /// Use a specific ssh binary instead of the one on PATH
    pub fn with_binary(mut self, path: impl Into<String>) -> Self {
        self.ssh_binary = path.into();
        self
    }

    fn build_command(&self, connection: &HostConnection, key_path: &std::path::Path) -> Command {
        let mut ssh_cmd = Command::new(&self.ssh_binary);

        ssh_cmd
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-p")
            .arg(connection.port.to_string())
            .arg("-i")
            .arg(key_path)
            .arg(connection.destination())
            // The script arrives on stdin so secrets never show up in a process list
            .arg("bash -s");

        ssh_cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        ssh_cmd
    }
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        connection: &HostConnection,
        script: &str,
        timeout: Duration,
    ) -> ProvisionResult<CommandOutput> {
        // NamedTempFile is created with 0600 permissions and removed on drop
        let key_file = tempfile::Builder::new()
            .prefix("k3sforge-key-")
            .tempfile()?;
        let mut key = connection.credential.private_key().expose().clone();
        if !key.ends_with('\n') {
            key.push('\n');
        }
        tokio::fs::write(key_file.path(), key).await?;

        let mut child = self
            .build_command(connection, key_file.path())
            .spawn()
            .map_err(|e| ProvisionError::Connection {
                host: connection.address.clone(),
                message: format!("failed to launch {}: {}", self.ssh_binary, e),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| ProvisionError::Connection {
            host: connection.address.clone(),
            message: "ssh stdin unavailable".to_string(),
        })?;
        let script = script.to_owned();
        let feed = async move {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await
        };

        debug!(host = %connection.address, "Running remote script over ssh");

        // Dropping the in-flight future on timeout kills the ssh process
        let output = match tokio::time::timeout(timeout, async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            if let Err(e) = fed {
                debug!(host = %connection.address, "ssh closed stdin early: {}", e);
            }
            output
        })
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ProvisionError::Connection {
                    host: connection.address.clone(),
                    message: format!("ssh failed: {}", e),
                })
            }
            Err(_) => {
                return Err(ProvisionError::Timeout {
                    host: connection.address.clone(),
                    after: timeout,
                })
            }
        };

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        if result.exit_code == SSH_ERROR_EXIT
            && is_transport_failure(&result.stderr, &connection.address)
        {
            return Err(ProvisionError::Connection {
                host: connection.address.clone(),
                message: result.stderr.trim().to_string(),
            });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k3sforge_common::Secret;

    fn connection() -> HostConnection {
        HostConnection {
            host_name: "mac1".to_string(),
            address: "10.0.0.1".to_string(),
            user: "admin".to_string(),
            port: 2222,
            credential: Credential::new("mac1", Secret::new("KEY".to_string())),
        }
    }

    #[test]
    fn test_into_success() {
        let ok = CommandOutput {
            stdout: "{}".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert!(ok.into_success("10.0.0.1").is_ok());

        let failed = CommandOutput {
            stdout: "{\"ip\":\"10.0.0.1\"}".to_string(),
            stderr: "boom".to_string(),
            exit_code: 3,
        };
        match failed.into_success("10.0.0.1") {
            Err(ProvisionError::RemoteExecution {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_ssh_command_line() {
        let executor = SshExecutor::default();
        let cmd = executor.build_command(&connection(), std::path::Path::new("/tmp/key"));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=10".to_string()));
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"admin@10.0.0.1".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("bash -s"));
        assert!(!args.iter().any(|a| a.contains("KEY")));
    }

    #[test]
    fn test_transport_failure_needs_our_address() {
        assert!(is_transport_failure(
            "ssh: connect to host 10.0.0.1 port 2222: Connection refused\n",
            "10.0.0.1"
        ));
        assert!(is_transport_failure(
            "admin@10.0.0.1: Permission denied (publickey).",
            "10.0.0.1"
        ));
        // The guest's sshd refusing limactl's inner hop
        assert!(!is_transport_failure(
            "ssh: connect to host 127.0.0.1 port 60022: Connection refused",
            "10.0.0.1"
        ));
        assert!(!is_transport_failure("", "10.0.0.1"));
    }

    /// Write an executable stand-in for ssh that prints `stderr` and exits 255
    #[cfg(unix)]
    fn failing_ssh(dir: &std::path::Path, stderr: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ssh");
        let body = format!(
            "#!/bin/sh\ncat > /dev/null\nprintf '%s\\n' {} >&2\nexit 255\n",
            crate::scripts::shell_quote(stderr)
        );
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remote_exit_255_keeps_readiness_polling() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SshExecutor::default().with_binary(failing_ssh(dir.path(), ""));
        let probe = crate::probe::ReadinessProbe::new(Duration::from_millis(10), 5);

        let result = probe
            .wait_for_command(
                "vm-ready",
                &executor,
                &connection(),
                "limactl shell 'k3s-master' echo ready > /dev/null 2>&1",
                Duration::from_secs(5),
            )
            .await;

        match result {
            Err(ProvisionError::ReadinessTimeout { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected readiness timeout, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SshExecutor::default().with_binary(failing_ssh(
            dir.path(),
            "ssh: connect to host 10.0.0.1 port 2222: Connection refused",
        ));

        let result = executor
            .execute(&connection(), "true", Duration::from_secs(5))
            .await;

        match result {
            Err(ProvisionError::Connection { host, message }) => {
                assert_eq!(host, "10.0.0.1");
                assert!(message.contains("Connection refused"));
            }
            other => panic!("expected connection error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_ssh_binary_is_connection_error() {
        let executor = SshExecutor::default().with_binary("/nonexistent/ssh-binary");
        let result = executor
            .execute(&connection(), "true", Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(ProvisionError::Connection { .. })));
    }
}
