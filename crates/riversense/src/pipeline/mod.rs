pub mod error;
pub mod orchestrator;
pub mod retry;
pub mod service;

pub use error::{DownloadError, PipelineError, RetryError, SubmitError};
pub use orchestrator::{Orchestrator, Outcome, SkipReason};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{ConversionService, Download};

/// Failure reason recorded when the retry bound is used up.
pub const RETRIES_EXHAUSTED: &str = "retries exhausted";
