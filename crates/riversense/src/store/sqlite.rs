//! SQLite-backed [`ArtifactStore`].

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};

use crate::db::job_repo::{self, CasOutcome, HeldRun, JobFilter, JobRow, StatusUpdate};
use crate::db::{Database, DatabaseError};

use super::{
    ArtifactAvailability, ArtifactStore, ConversionJob, JobId, JobStatus, Ownership, StoreError,
    TransitionFields,
};

pub struct SqliteArtifactStore {
    db: Database,
}

impl SqliteArtifactStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn apply(
        &self,
        id: JobId,
        expected: JobStatus,
        held: Option<&Ownership>,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<ConversionJob, StoreError> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id,
                from: expected,
                to: next,
            });
        }
        fields
            .validate_for(next)
            .map_err(|reason| StoreError::InvalidFields { id, reason })?;

        let artifact_path = fields
            .artifact_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned());

        let outcome = job_repo::compare_and_set(
            &self.db,
            &StatusUpdate {
                id,
                expected_status: expected.as_str(),
                held: held.map(|h| HeldRun {
                    run: h.run,
                    attempts: h.attempts,
                    owner: h.owner.as_deref(),
                }),
                status: next.as_str(),
                artifact_path: artifact_path.as_deref(),
                failure_reason: fields.failure_reason.as_deref(),
                attempts: fields.attempts,
                owner: fields.owner.as_deref(),
                bump_run: expected == JobStatus::Failed && next == JobStatus::Pending,
                updated_at: Utc::now().timestamp_millis(),
            },
        )?;

        match outcome {
            CasOutcome::Applied => {
                log::debug!("Job {}: {} -> {}", id, expected, next);
                self.get(id)
            }
            CasOutcome::Mismatch { actual } => {
                let actual = parse_status(&actual)?;
                if actual == expected {
                    Err(StoreError::Superseded { id })
                } else {
                    Err(StoreError::Conflict {
                        id,
                        expected,
                        actual,
                    })
                }
            }
            CasOutcome::Missing => Err(StoreError::NotFound(id)),
        }
    }
}

fn parse_status(s: &str) -> Result<JobStatus, DatabaseError> {
    JobStatus::parse(s).ok_or_else(|| DatabaseError::CorruptRow {
        table: "jobs",
        reason: format!("unknown status '{}'", s),
    })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(|| {
        log::warn!("Out-of-range timestamp {} in jobs table", ms);
        DateTime::<Utc>::UNIX_EPOCH
    })
}

fn job_from_row(row: JobRow) -> Result<ConversionJob, DatabaseError> {
    Ok(ConversionJob {
        id: row.id,
        status: parse_status(&row.status)?,
        raw_payload: row.raw_payload,
        artifact_path: row.artifact_path.map(PathBuf::from),
        failure_reason: row.failure_reason,
        attempts: row.attempts,
        run: row.run,
        owner: row.owner,
        created_at: from_millis(row.created_at),
        updated_at: from_millis(row.updated_at),
    })
}

impl ArtifactStore for SqliteArtifactStore {
    fn create(&self, raw_payload: &[u8]) -> Result<JobId, StoreError> {
        let id = job_repo::insert(&self.db, raw_payload, Utc::now().timestamp_millis())?;
        log::debug!("Created job {} ({} bytes)", id, raw_payload.len());
        Ok(id)
    }

    fn get(&self, id: JobId) -> Result<ConversionJob, StoreError> {
        let row = job_repo::find_by_id(&self.db, id)?.ok_or(StoreError::NotFound(id))?;
        Ok(job_from_row(row)?)
    }

    fn transition(
        &self,
        id: JobId,
        expected: JobStatus,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<ConversionJob, StoreError> {
        self.apply(id, expected, None, next, fields)
    }

    fn transition_owned(
        &self,
        id: JobId,
        held: &Ownership,
        next: JobStatus,
        fields: TransitionFields,
    ) -> Result<ConversionJob, StoreError> {
        self.apply(id, held.status, Some(held), next, fields)
    }

    fn find_by_artifact_availability(&self, id: JobId) -> Result<ArtifactAvailability, StoreError> {
        let job = match self.get(id) {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(ArtifactAvailability::NotFound),
            Err(e) => return Err(e),
        };

        Ok(match (job.status, job.artifact_path) {
            (JobStatus::Completed, Some(path)) => ArtifactAvailability::Ready(path),
            (status, _) => ArtifactAvailability::NotReady(status),
        })
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<ConversionJob>, StoreError> {
        let rows = job_repo::query(&self.db, filter)?;
        rows.into_iter()
            .map(|row| job_from_row(row).map_err(StoreError::from))
            .collect()
    }

    fn count_by_status(&self, status: JobStatus) -> Result<u64, StoreError> {
        Ok(job_repo::count_by_status(&self.db, status.as_str())?)
    }
}
