//! GnssLogger payload parsing and android_rinex staging.
//!
//! Two upload shapes are accepted:
//!
//! - GnssLogger CSV text, records separated by newlines or `;`. `Raw,` and
//!   `Fix,` records are kept, `#` comments and other record types (Status,
//!   Nav, OrientationDeg, ...) are dropped.
//! - JSON `{"raw": [...], "fix": [...]}` with one record per string.

use serde::Deserialize;

use super::ConversionError;

/// Header block android_rinex expects at the top of a GnssLogger file.
const STAGING_HEADER: &str = "# \n\
# Header Description:\n\
# \n\
# Version: 1.4.0.0, Platform: N\n\
# \n\
# Raw,ElapsedRealtimeMillis,TimeNanos,LeapSecond,TimeUncertaintyNanos,FullBiasNanos,BiasNanos,BiasUncertaintyNanos,DriftNanosPerSecond,DriftUncertaintyNanosPerSecond,HardwareClockDiscontinuityCount, Svid,TimeOffsetNanos,State,ReceivedSvTimeNanos,ReceivedSvTimeUncertaintyNanos,Cn0DbHz,PseudorangeRateMetersPerSecond,PseudorangeRateUncertaintyMetersPerSecond,AccumulatedDeltaRangeState,AccumulatedDeltaRangeMeters,AccumulatedDeltaRangeUncertaintyMeters,CarrierFrequencyHz,CarrierCycles,CarrierPhase,CarrierPhaseUncertainty,MultipathIndicator,SnrInDb,ConstellationType\n\
# \n\
# Fix,Provider,Latitude,Longitude,Altitude,Speed,Accuracy,(UTC)TimeInMs\n\
# \n\
# Nav,Svid,Type,Status,MessageId,Sub-messageId,Data(Bytes)\n\
# \n";

const RAW_PREFIX: &str = "Raw,";
const FIX_PREFIX: &str = "Fix,";

#[derive(Debug, Deserialize)]
struct JsonUpload {
    #[serde(default)]
    raw: Vec<String>,
    #[serde(default)]
    fix: Vec<String>,
}

/// The measurement records of one upload, in upload order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GnssLog {
    pub raw: Vec<String>,
    pub fix: Vec<String>,
}

impl GnssLog {
    pub fn parse(payload: &[u8]) -> Result<Self, ConversionError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| ConversionError::malformed(format!("payload is not UTF-8 text: {}", e)))?;
        let text = text.trim_start_matches('\u{feff}').trim();

        if text.is_empty() {
            return Err(ConversionError::malformed("empty payload"));
        }

        let log = if text.starts_with('{') {
            Self::from_json(text)?
        } else {
            Self::from_csv(text)
        };

        if log.raw.is_empty() {
            return Err(ConversionError::malformed(
                "payload contains no Raw measurement records",
            ));
        }
        Ok(log)
    }

    fn from_csv(text: &str) -> Self {
        let mut log = GnssLog::default();
        let mut skipped = 0usize;

        for record in text.split(['\n', ';']).map(str::trim) {
            if record.is_empty() || record.starts_with('#') {
                continue;
            }
            if record.starts_with(RAW_PREFIX) {
                log.raw.push(record.to_string());
            } else if record.starts_with(FIX_PREFIX) {
                log.fix.push(record.to_string());
            } else {
                skipped += 1;
            }
        }

        if skipped > 0 {
            log::debug!("Ignored {} non-measurement records", skipped);
        }
        log
    }

    fn from_json(text: &str) -> Result<Self, ConversionError> {
        let upload: JsonUpload = serde_json::from_str(text)
            .map_err(|e| ConversionError::malformed(format!("invalid JSON upload: {}", e)))?;

        Ok(GnssLog {
            raw: clean_records(upload.raw, "raw")?,
            fix: clean_records(upload.fix, "fix")?,
        })
    }

    /// Renders the android_rinex input file: header, Fix records, Raw records.
    pub fn render_staging(&self) -> String {
        let body_len: usize = self
            .fix
            .iter()
            .chain(self.raw.iter())
            .map(|r| r.len() + 1)
            .sum();
        let mut out = String::with_capacity(STAGING_HEADER.len() + body_len);

        out.push_str(STAGING_HEADER);
        for record in self.fix.iter().chain(self.raw.iter()) {
            out.push_str(record);
            out.push('\n');
        }
        out
    }
}

fn clean_records(records: Vec<String>, field: &str) -> Result<Vec<String>, ConversionError> {
    let mut cleaned = Vec::with_capacity(records.len());
    for record in records {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }
        if record.contains(['\n', '\r']) {
            return Err(ConversionError::malformed(format!(
                "'{}' record spans multiple lines",
                field
            )));
        }
        cleaned.push(record.to_string());
    }
    Ok(cleaned)
}
