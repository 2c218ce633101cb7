//! Logging configuration
//!
//! Console output goes to stderr so stdout stays free for machine-readable
//! command output. An optional rolling JSON log file can be added.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
pub use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub level: String,
    /// Directory for rolling JSON log files, none for console only
    pub log_dir: Option<PathBuf>,
    pub rotation: LogRotation,
}

/// Log rotation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            rotation: LogRotation::Daily,
        }
    }
}

impl LoggingConfig {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    /// Install the global subscriber.
    ///
    /// Keep the returned guard alive for the life of the process, otherwise
    /// buffered file output is lost.
    pub fn init(&self) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
        let console_layer = fmt::layer()
            .with_target(false)
            .with_level(true)
            .with_ansi(true)
            .with_writer(io::stderr);

        let guard = if let Some(ref dir) = self.log_dir {
            let file_appender = match self.rotation {
                LogRotation::Hourly => rolling::hourly(dir, "k3sforge.log"),
                LogRotation::Daily => rolling::daily(dir, "k3sforge.log"),
                LogRotation::Never => rolling::never(dir, "k3sforge.log"),
            };
            let (writer, guard) = non_blocking(file_appender);

            let file_layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_writer(writer);

            tracing_subscriber::registry()
                .with(self.env_filter())
                .with(console_layer)
                .with(file_layer)
                .try_init()?;
            Some(guard)
        } else {
            tracing_subscriber::registry()
                .with(self.env_filter())
                .with(console_layer)
                .try_init()?;
            None
        };

        tracing::debug!("Logging initialized - level: {}", self.level);

        Ok(guard)
    }
}
