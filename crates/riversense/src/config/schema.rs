use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::convert::{GnssLoggerConverter, ToolCommand};
use crate::pipeline::RetryPolicy;
use crate::storage::filesystem::DEFAULT_ARTIFACT_DIRECTORY;
use crate::telemetry::{LogFormat, LogLevel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Defaults to `~/.riversense/data/riversense.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_artifact_directory")]
    pub artifact_directory: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_artifact_directory() -> String {
    DEFAULT_ARTIFACT_DIRECTORY.to_string()
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            artifact_directory: default_artifact_directory(),
            worker_count: default_worker_count(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            converter: ConverterConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Database location with `~/` expanded, falling back to the default
    /// location under the home directory.
    pub fn database_path(&self) -> Option<PathBuf> {
        match self.database_path {
            Some(ref path) => Some(expand_home(path)),
            None => crate::db::default_database_path(),
        }
    }

    pub fn artifact_directory(&self) -> PathBuf {
        expand_home(&self.artifact_directory)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            max_tool_failure_retries: self.retry.max_tool_failure_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    /// Builds the converter. `None` when the command list is empty, which
    /// validation rejects.
    pub fn converter(&self) -> Option<GnssLoggerConverter> {
        let command = ToolCommand::from_argv(&self.converter.command)?;
        let converter = GnssLoggerConverter::new(
            command,
            Duration::from_secs(self.converter.timeout_seconds),
        );
        Some(match self.converter.scratch_directory {
            Some(ref dir) => converter.with_scratch_dir(expand_home(dir)),
            None => converter,
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_lease_seconds() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl QueueConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_tool_failure_retries")]
    pub max_tool_failure_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_tool_failure_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_tool_failure_retries: default_max_tool_failure_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverterConfig {
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub scratch_directory: Option<String>,
}

fn default_command() -> Vec<String> {
    vec![
        "python3".to_string(),
        "./android_rinex/bin/gnsslogger_to_rnx".to_string(),
    ]
}

fn default_timeout_seconds() -> u64 {
    120
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            timeout_seconds: default_timeout_seconds(),
            scratch_directory: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub format: LogFormat,
}
