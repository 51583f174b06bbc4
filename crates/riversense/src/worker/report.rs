use crate::pipeline::Outcome;
use crate::store::JobId;

/// What one worker did with one delivery.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub worker_id: usize,
    pub job_id: JobId,
    pub attempt: u32,
    pub outcome: Option<Outcome>,
    /// Set when the delivery was left unacknowledged for redelivery.
    pub error: Option<String>,
}

impl JobReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
