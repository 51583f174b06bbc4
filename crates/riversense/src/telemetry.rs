//! Logging setup.
//!
//! Library code logs through the `log` macros and opens `tracing` spans
//! around deliveries. [`init_logging`] installs one `tracing` subscriber for
//! both and bridges `log` records into it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to bridge log records: {0}")]
    LogBridge(#[from] log::SetLoggerError),

    #[error("Failed to install subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Installs the global subscriber. `RUST_LOG` directives take precedence
/// over `level`. Call once at startup.
pub fn init_logging(level: LogLevel, format: LogFormat) -> Result<(), TelemetryError> {
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::builder()
        .with_default_directive(level.to_tracing_level().into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(fmt_layer::layer().with_writer(std::io::stderr).with_target(true)),
        )?,
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(
                fmt_layer::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true),
            ),
        )?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_serde_is_lowercase() {
        let level: LogLevel = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(level, LogLevel::Warn);
        assert_eq!(serde_json::to_string(&LogLevel::Debug).unwrap(), "\"debug\"");
        assert_eq!(level.to_tracing_level(), Level::WARN);
    }

    #[test]
    fn test_format_default_is_text() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
