//! Retry decisions for failed conversions.

use std::time::Duration;

use crate::convert::ConversionErrorKind;

/// Bounds and backoff for automatic retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed for `ToolUnavailable` and `Timeout`.
    pub max_retries: u32,
    /// Retries allowed for `ToolFailure`.
    pub max_tool_failure_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_tool_failure_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The error can never succeed on this input.
    Permanent,
    /// Schedule `next_attempt` after `delay`.
    Retry { next_attempt: u32, delay: Duration },
    /// The retry bound for this kind of error is used up.
    Exhausted,
}

impl RetryPolicy {
    /// Decides what follows a failure of run `attempt` (0 for the first run).
    pub fn decide(&self, kind: ConversionErrorKind, attempt: u32) -> RetryDecision {
        if kind.is_permanent() {
            return RetryDecision::Permanent;
        }
        let bound = match kind {
            ConversionErrorKind::ToolFailure => self.max_tool_failure_retries,
            _ => self.max_retries,
        };

        if attempt >= bound {
            return RetryDecision::Exhausted;
        }

        RetryDecision::Retry {
            next_attempt: attempt + 1,
            delay: self.backoff(attempt),
        }
    }

    /// `min(base_delay * 2^attempt, max_delay)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}
