//! Artifact store: the durable record of every conversion job.
//!
//! The store is the single source of truth for job lifecycle state. All
//! status changes go through [`ArtifactStore::transition`], a
//! compare-and-swap that also enforces the state machine edges and the
//! field invariants of each status.
//!
//! Each Failed to Pending retry starts a new *run* of the job. While a job
//! is Processing, the delivery running its current attempt is recorded as
//! the job's owner. [`ArtifactStore::transition_owned`] applies only while
//! the caller still holds the run, attempt and owner it observed.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DatabaseError;

pub mod sqlite;

pub use crate::db::job_repo::JobFilter;
pub use sqlite::SqliteArtifactStore;

/// Monotonically assigned job identifier.
pub type JobId = i64;

/// Lifecycle status of a conversion job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `Processing -> Processing` only rewrites the retry counter.
    /// `Pending -> Failed` is reserved for ingestion aborting a job it could
    /// not enqueue. `Failed -> Pending` is the explicit retry request.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conversion job as recorded by the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionJob {
    pub id: JobId,
    /// The uploaded measurement log. Written once at creation.
    #[serde(skip)]
    pub raw_payload: Vec<u8>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Automatic retries scheduled for the current run.
    pub attempts: u32,
    /// Number of explicit retries, 0 for the first run.
    pub run: u32,
    /// Lease token of the delivery running the current attempt. `None` while
    /// a scheduled retry waits to be picked up.
    #[serde(skip)]
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived fields written together with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    pub artifact_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    /// New retry counter; `None` keeps the stored value.
    pub attempts: Option<u32>,
    /// Owner recorded with a Processing job. Always written.
    pub owner: Option<String>,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn completed(artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            artifact_path: Some(artifact_path.into()),
            ..Self::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn attempts(attempts: u32) -> Self {
        Self {
            attempts: Some(attempts),
            ..Self::default()
        }
    }

    /// Ownership of the job's current attempt by the delivery holding
    /// `lease_token`.
    pub fn owned_by(lease_token: impl Into<String>) -> Self {
        Self {
            owner: Some(lease_token.into()),
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Checks that the fields fit `status`: Completed carries only a path,
    /// Failed carries only a non-empty reason, other states carry neither.
    pub fn validate_for(&self, status: JobStatus) -> Result<(), String> {
        let has_path = self.artifact_path.is_some();
        let has_reason = self.failure_reason.is_some();
        match status {
            JobStatus::Completed if !has_path => Err("completed job needs an artifact path".into()),
            _ if self.owner.is_some() && status != JobStatus::Processing => {
                Err(format!("{} job cannot have an owner", status))
            }
            JobStatus::Completed if has_reason => {
                Err("completed job cannot carry a failure reason".into())
            }
            JobStatus::Failed if has_path => Err("failed job cannot carry an artifact path".into()),
            JobStatus::Failed => match self.failure_reason.as_deref() {
                Some(reason) if !reason.trim().is_empty() => Ok(()),
                _ => Err("failed job needs a non-empty failure reason".into()),
            },
            JobStatus::Pending | JobStatus::Processing if has_path || has_reason => Err(format!(
                "{} job cannot carry an artifact path or failure reason",
                status
            )),
            _ => Ok(()),
        }
    }
}

/// What a caller observed about a job it is working on. Guarded
/// transitions apply only while the job still matches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub status: JobStatus,
    pub run: u32,
    pub attempts: u32,
    pub owner: Option<String>,
}

impl Ownership {
    pub fn of(job: &ConversionJob) -> Self {
        Self {
            status: job.status,
            run: job.run,
            attempts: job.attempts,
            owner: job.owner.clone(),
        }
    }
}

/// Answer of the download path's availability lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactAvailability {
    Ready(PathBuf),
    NotReady(JobStatus),
    NotFound,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Storage(#[from] DatabaseError),

    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("job {id} was taken over or retried since it was read")]
    Superseded { id: JobId },

    #[error("job {id}: transition {from} -> {to} is not allowed")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {id}: {reason}")]
    InvalidFields { id: JobId, reason: String },
}

impl StoreError {
    /// A lost compare-and-swap race, expected under duplicate delivery.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Superseded { .. })
    }
}

pub trait ArtifactStore: Send + Sync {
    /// Allocates a new Pending job holding `raw_payload`.
    fn create(&self, raw_payload: &[u8]) -> Result<JobId, StoreError>;

    fn get(&self, id: JobId) -> Result<ConversionJob, StoreError>;

    /// Moves the job from `expected` to `next`, writing `fields`, only if its
    /// current status is `expected`. Returns the updated job.
    fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<ConversionJob, StoreError>;

    /// Like [`transition`](Self::transition), but also requires the job's
    /// run, retry counter and owner to still equal `held`. Fails with
    /// `Superseded` when only those changed.
    fn transition_owned(
        &self,
        id: JobId,
        held: &Ownership,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<ConversionJob, StoreError>;

    fn find_by_artifact_availability(&self, id: JobId) -> Result<ArtifactAvailability, StoreError>;

    fn list(&self, filter: &JobFilter) -> Result<Vec<ConversionJob>, StoreError>;

    fn count_by_status(&self, status: JobStatus) -> Result<u64, StoreError>;
}
