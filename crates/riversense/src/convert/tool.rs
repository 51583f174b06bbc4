//! External android_rinex converter invocation.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tokio::process::Command as TokioCommand;

use super::gnss_log::GnssLog;
use super::{ConversionError, RinexArtifact, RinexConverter};

/// Bytes of tool stderr kept in a failure message.
const STDERR_TAIL_BYTES: usize = 512;

/// Header label whose date field records when the converter ran.
const RUN_DATE_LABEL: &[u8] = b"PGM / RUN BY / DATE";
const END_OF_HEADER_LABEL: &[u8] = b"END OF HEADER";
/// Byte range of the date field in a `PGM / RUN BY / DATE` line.
const RUN_DATE_FIELD: std::ops::Range<usize> = 40..60;
const HEADER_LABEL_COLUMN: usize = 60;

const STAGING_FILE_NAME: &str = "gnsslogger.txt";
const OUTPUT_FILE_NAME: &str = "output.obs";

/// Program plus leading arguments of the converter. The converter is run as
/// `<program> <args…> -o <output> <staging>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
}

impl ToolCommand {
    /// Builds a command from its argv form. Returns `None` for an empty list.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// `python3 ./android_rinex/bin/gnsslogger_to_rnx`
    pub fn android_rinex() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["./android_rinex/bin/gnsslogger_to_rnx".to_string()],
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// First argument naming a file that does not exist, such as a
    /// converter script that was never installed.
    fn missing_script(&self) -> Option<&str> {
        self.args
            .iter()
            .map(String::as_str)
            .filter(|arg| !arg.starts_with('-') && arg.contains(std::path::MAIN_SEPARATOR))
            .find(|arg| !Path::new(arg).exists())
    }
}

impl Default for ToolCommand {
    fn default() -> Self {
        Self::android_rinex()
    }
}

/// Converter backed by the android_rinex `gnsslogger_to_rnx` tool.
#[derive(Debug, Clone)]
pub struct GnssLoggerConverter {
    command: ToolCommand,
    timeout: Duration,
    scratch_dir: Option<PathBuf>,
}

impl GnssLoggerConverter {
    pub fn new(command: ToolCommand, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            scratch_dir: None,
        }
    }

    /// Places per-call staging directories under `dir` instead of the
    /// system temp directory.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    fn scratch(&self) -> Result<tempfile::TempDir, ConversionError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("riversense-convert-");
        let dir = match self.scratch_dir {
            Some(ref base) => builder.tempdir_in(base),
            None => builder.tempdir(),
        };
        dir.map_err(|e| ConversionError::unavailable(format!("cannot create staging directory: {}", e)))
    }

    async fn run_tool(&self, staging: &Path, output: &Path) -> Result<(), ConversionError> {
        if let Some(script) = self.command.missing_script() {
            return Err(ConversionError::unavailable(format!(
                "converter not found at {}",
                script
            )));
        }

        let mut cmd = TokioCommand::new(&self.command.program);
        cmd.args(&self.command.args)
            .arg("-o")
            .arg(output)
            .arg(staging)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            ConversionError::unavailable(format!("failed to start {}: {}", self.command.program, e))
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let result = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ConversionError::timeout(format!(
                    "converter did not finish within {}s",
                    self.timeout.as_secs_f64()
                ))
            })?;

        let out = result.map_err(|e| {
            ConversionError::unavailable(format!("lost contact with converter process: {}", e))
        })?;

        if !out.status.success() {
            return Err(ConversionError::tool_failure(format!(
                "converter exited with {}: {}",
                out.status,
                stderr_tail(&out.stderr)
            )));
        }

        if !out.stderr.is_empty() {
            debug!("Converter warnings: {}", stderr_tail(&out.stderr));
        }
        Ok(())
    }
}

impl RinexConverter for GnssLoggerConverter {
    fn convert(&self, raw: &[u8]) -> Result<RinexArtifact, ConversionError> {
        let log = GnssLog::parse(raw)?;
        debug!(
            "Staging {} raw and {} fix records for conversion",
            log.raw.len(),
            log.fix.len()
        );

        let scratch = self.scratch()?;
        let staging = scratch.path().join(STAGING_FILE_NAME);
        let output = scratch.path().join(OUTPUT_FILE_NAME);

        std::fs::write(&staging, log.render_staging()).map_err(|e| {
            ConversionError::unavailable(format!("cannot write staging file: {}", e))
        })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ConversionError::unavailable(format!("cannot start runtime: {}", e)))?;
        runtime.block_on(self.run_tool(&staging, &output))?;

        let bytes = match std::fs::read(&output) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConversionError::tool_failure(
                    "converter exited successfully but wrote no output",
                ));
            }
            Err(e) => {
                return Err(ConversionError::unavailable(format!(
                    "cannot read converter output: {}",
                    e
                )));
            }
        };

        if bytes.is_empty() {
            return Err(ConversionError::tool_failure("converter produced an empty file"));
        }

        if let Err(e) = scratch.close() {
            warn!("Failed to remove staging directory: {}", e);
        }

        Ok(RinexArtifact {
            bytes: blank_run_date(bytes),
        })
    }
}

/// Blanks the creation date the converter stamps into the RINEX header so
/// identical logs convert to identical bytes. Lines past the header are
/// left alone.
fn blank_run_date(mut bytes: Vec<u8>) -> Vec<u8> {
    let mut start = 0;
    while start < bytes.len() {
        let end = bytes[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(bytes.len(), |i| start + i);

        let label = header_label(&bytes[start..end]);
        if label == Some(END_OF_HEADER_LABEL) {
            break;
        }
        if label == Some(RUN_DATE_LABEL) {
            bytes[start + RUN_DATE_FIELD.start..start + RUN_DATE_FIELD.end].fill(b' ');
        }
        start = end + 1;
    }
    bytes
}

fn header_label(line: &[u8]) -> Option<&[u8]> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let label = line.get(HEADER_LABEL_COLUMN..)?;
    let last = label.iter().rposition(|b| !b.is_ascii_whitespace())?;
    Some(&label[..=last])
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL_BYTES {
        return text.to_string();
    }
    let cut = text.len() - STDERR_TAIL_BYTES;
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= cut)
        .unwrap_or(0);
    format!("...{}", &text[start..])
}
