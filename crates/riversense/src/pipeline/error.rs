use thiserror::Error;

use crate::error::ArtifactError;
use crate::queue::QueueError;
use crate::store::{JobId, JobStatus, StoreError};

/// Infrastructure failure while handling a delivery. The delivery is left
/// unacknowledged so the queue hands it out again after the lease.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Re-enqueue failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Artifact write failed: {0}")]
    Artifact(#[from] ArtifactError),
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Could not record job: {0}")]
    Store(#[from] StoreError),

    #[error("Job {job_id} could not be queued: {source}")]
    QueueUnavailable {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {id} is {status}; only failed jobs can be retried")]
    NotFailed { id: JobId, status: JobStatus },

    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Job {job_id} could not be queued: {source}")]
    QueueUnavailable {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {id} is {status}; no artifact yet")]
    NotReady { id: JobId, status: JobStatus },

    #[error("Artifact for job {id} is missing at {path}")]
    ArtifactMissing { id: JobId, path: std::path::PathBuf },

    #[error("Store failed: {0}")]
    Store(#[from] StoreError),

    #[error("Artifact read failed: {0}")]
    Artifact(#[from] ArtifactError),
}
