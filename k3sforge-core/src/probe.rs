//! Bounded readiness polling
//!
//! VM boot and k3s installation finish asynchronously relative to the
//! command that starts them. A probe polls a check at a fixed interval and
//! gives up with `ReadinessTimeout` after a fixed number of attempts.

use crate::error::{ProvisionError, ProvisionResult};
use crate::executor::{HostConnection, RemoteExecutor};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Polling parameters for one readiness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessProbe {
    /// Pause after every unsuccessful attempt
    #[serde(rename = "interval_secs", with = "duration_secs")]
    pub interval: Duration,
    pub max_attempts: u32,
}

impl ReadinessProbe {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Upper bound on how long [`wait_until`](Self::wait_until) sleeps
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Poll `check` until it reports ready.
    ///
    /// `check` receives the 1-based attempt number. `Ok(false)` counts as a
    /// failed attempt, an `Err` aborts polling immediately. Every failed
    /// attempt is followed by a full interval, so exhaustion is reported
    /// no earlier than `max_attempts * interval`. Returns the attempt that
    /// succeeded.
    pub async fn wait_until<F, Fut>(&self, check_name: &str, mut check: F) -> ProvisionResult<u32>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ProvisionResult<bool>>,
    {
        let started = Instant::now();

        for attempt in 1..=self.max_attempts {
            if check(attempt).await? {
                info!(check = check_name, attempt, "Ready");
                return Ok(attempt);
            }

            debug!(
                check = check_name,
                "Still waiting... (attempt {}/{})", attempt, self.max_attempts
            );
            tokio::time::sleep(self.interval).await;
        }

        Err(ProvisionError::ReadinessTimeout {
            check: check_name.to_string(),
            attempts: self.max_attempts,
            elapsed: started.elapsed(),
        })
    }

    /// Poll a remote shell check; exit status 0 means ready.
    ///
    /// An attempt that overruns `attempt_timeout` counts as not ready.
    /// Connection failures abort the poll.
    pub async fn wait_for_command(
        &self,
        check_name: &str,
        executor: &dyn RemoteExecutor,
        connection: &HostConnection,
        script: &str,
        attempt_timeout: Duration,
    ) -> ProvisionResult<u32> {
        self.wait_until(check_name, |_| async move {
            match executor.execute(connection, script, attempt_timeout).await {
                Ok(output) => Ok(output.success()),
                Err(ProvisionError::Timeout { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
