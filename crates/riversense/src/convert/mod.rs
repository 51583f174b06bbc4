//! Conversion adapter: turns a raw GNSS measurement log into RINEX bytes.
//!
//! The pipeline only sees [`RinexConverter`]. The production implementation,
//! [`GnssLoggerConverter`], stages the log in the android_rinex input layout
//! and shells out to the external converter.

use std::fmt;

use thiserror::Error;

pub mod gnss_log;
pub mod tool;

pub use gnss_log::GnssLog;
pub use tool::{GnssLoggerConverter, ToolCommand};

/// RINEX observation data produced from one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RinexArtifact {
    pub bytes: Vec<u8>,
}

impl RinexArtifact {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

/// Failure classes of a conversion, used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversionErrorKind {
    /// The payload cannot be converted. Never retried.
    MalformedInput,
    /// The tool could not be started.
    ToolUnavailable,
    /// The tool ran past its deadline and was killed.
    Timeout,
    /// The tool ran and reported failure.
    ToolFailure,
}

impl ConversionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionErrorKind::MalformedInput => "malformed input",
            ConversionErrorKind::ToolUnavailable => "tool unavailable",
            ConversionErrorKind::Timeout => "timeout",
            ConversionErrorKind::ToolFailure => "tool failure",
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ConversionErrorKind::MalformedInput)
    }
}

impl fmt::Display for ConversionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ConversionError {
    pub kind: ConversionErrorKind,
    pub message: String,
}

impl ConversionError {
    pub fn new(kind: ConversionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ConversionErrorKind::MalformedInput, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ConversionErrorKind::ToolUnavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ConversionErrorKind::Timeout, message)
    }

    pub fn tool_failure(message: impl Into<String>) -> Self {
        Self::new(ConversionErrorKind::ToolFailure, message)
    }
}

/// Converts raw measurement payloads to RINEX.
///
/// Implementations must be idempotent: the same payload yields
/// byte-identical output. The payload is borrowed for the duration of the
/// call and nothing derived from it is retained afterwards.
pub trait RinexConverter: Send + Sync {
    fn convert(&self, raw: &[u8]) -> Result<RinexArtifact, ConversionError>;
}
