//! Ingestion and download entry points.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};

use crate::queue::{JobQueue, QueueError};
use crate::storage::ArtifactStorage;
use crate::store::{
    ArtifactAvailability, ArtifactStore, ConversionJob, JobFilter, JobId, JobStatus, StoreError,
    TransitionFields,
};

use super::error::{DownloadError, RetryError, SubmitError};

/// A finished artifact ready to hand to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub path: PathBuf,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub struct ConversionService {
    store: Arc<dyn ArtifactStore>,
    queue: Arc<dyn JobQueue>,
    artifacts: Arc<dyn ArtifactStorage>,
}

impl ConversionService {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        queue: Arc<dyn JobQueue>,
        artifacts: Arc<dyn ArtifactStorage>,
    ) -> Self {
        Self {
            store,
            queue,
            artifacts,
        }
    }

    /// Records an upload and queues its conversion.
    ///
    /// If the job cannot be queued it is marked Failed before the error is
    /// returned, so no Pending job is left without queued work.
    pub fn submit(&self, payload: &[u8]) -> Result<JobId, SubmitError> {
        let job_id = self.store.create(payload)?;

        if let Err(e) = self.queue.enqueue(job_id, 0) {
            self.abort_unqueued(job_id, JobStatus::Pending, &e);
            return Err(SubmitError::QueueUnavailable { job_id, source: e });
        }

        info!("Accepted job {} ({} bytes)", job_id, payload.len());
        Ok(job_id)
    }

    /// Sends a Failed job back to Pending as a new run with a fresh retry
    /// counter. Messages left over from earlier runs are skipped.
    pub fn retry(&self, id: JobId) -> Result<ConversionJob, RetryError> {
        let revived = self.store.transition(
            id,
            JobStatus::Failed,
            JobStatus::Pending,
            TransitionFields::attempts(0),
        );
        let job = match revived {
            Ok(job) => job,
            Err(StoreError::NotFound(id)) => return Err(RetryError::NotFound(id)),
            Err(StoreError::Conflict { actual, .. }) => {
                return Err(RetryError::NotFailed { id, status: actual })
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.queue.enqueue(id, job.run) {
            self.abort_unqueued(id, JobStatus::Pending, &e);
            return Err(RetryError::QueueUnavailable { job_id: id, source: e });
        }

        info!("Job {} re-queued on request", id);
        Ok(job)
    }

    pub fn status(&self, id: JobId) -> Result<ConversionJob, StoreError> {
        self.store.get(id)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<ConversionJob>, StoreError> {
        self.store.list(filter)
    }

    /// Job counts for every status, in lifecycle order.
    pub fn counts(&self) -> Result<Vec<(JobStatus, u64)>, StoreError> {
        JobStatus::ALL
            .iter()
            .map(|&status| Ok((status, self.store.count_by_status(status)?)))
            .collect()
    }

    pub fn download(&self, id: JobId) -> Result<Download, DownloadError> {
        let path = match self.store.find_by_artifact_availability(id)? {
            ArtifactAvailability::Ready(path) => path,
            ArtifactAvailability::NotReady(status) => {
                return Err(DownloadError::NotReady { id, status })
            }
            ArtifactAvailability::NotFound => return Err(DownloadError::NotFound(id)),
        };

        let bytes = match self.artifacts.read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.is_missing() => {
                warn!("Job {} is completed but {} is gone", id, path.display());
                return Err(DownloadError::ArtifactMissing { id, path });
            }
            Err(e) => return Err(e.into()),
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("job_{}.obs", id));

        Ok(Download {
            path,
            file_name,
            bytes,
        })
    }

    fn abort_unqueued(&self, id: JobId, from: JobStatus, cause: &QueueError) {
        let reason = format!("enqueue failed: {}", cause);
        match self
            .store
            .transition(id, from, JobStatus::Failed, TransitionFields::failed(reason))
        {
            Ok(_) => warn!("Job {} marked failed: could not be queued ({})", id, cause),
            Err(e) => error!("Job {} could not be queued and could not be marked failed: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::db::Database;
    use crate::queue::{ShutdownSignal, SqliteJobQueue};
    use crate::storage::FileArtifactStorage;
    use crate::store::SqliteArtifactStore;

    struct Fixture {
        dir: TempDir,
        store: Arc<SqliteArtifactStore>,
        queue: Arc<SqliteJobQueue>,
        service: ConversionService,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(SqliteArtifactStore::new(db.clone()));
        let queue = Arc::new(SqliteJobQueue::new(
            db,
            Duration::from_secs(60),
            Duration::from_millis(10),
        ));
        let service = ConversionService::new(
            store.clone(),
            queue.clone(),
            Arc::new(FileArtifactStorage::new(dir.path())),
        );
        Fixture {
            dir,
            store,
            queue,
            service,
        }
    }

    fn fail_job(store: &SqliteArtifactStore, id: JobId) {
        store
            .transition(id, JobStatus::Pending, JobStatus::Processing, TransitionFields::none())
            .unwrap();
        store
            .transition(id, JobStatus::Processing, JobStatus::Failed, TransitionFields::failed("boom"))
            .unwrap();
    }

    #[test]
    fn test_submit_creates_pending_job_with_work() {
        let fx = fixture();
        let id = fx.service.submit(b"Raw,1").unwrap();

        assert_eq!(fx.service.status(id).unwrap().status, JobStatus::Pending);
        let delivery = fx.queue.dequeue(&ShutdownSignal::new()).unwrap().unwrap();
        assert_eq!(delivery.job_id, id);
    }

    #[test]
    fn test_submit_with_queue_down_leaves_no_pending_job() {
        let fx = fixture();
        fx.queue.close();

        let err = fx.service.submit(b"Raw,1").unwrap_err();
        let job_id = match err {
            SubmitError::QueueUnavailable { job_id, .. } => job_id,
            other => panic!("unexpected error: {}", other),
        };

        let job = fx.service.status(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.failure_reason.unwrap().starts_with("enqueue failed"));
        assert_eq!(fx.store.count_by_status(JobStatus::Pending).unwrap(), 0);
    }

    #[test]
    fn test_retry_requires_failed_job() {
        let fx = fixture();
        let id = fx.service.submit(b"Raw,1").unwrap();

        assert!(matches!(
            fx.service.retry(id),
            Err(RetryError::NotFailed { status: JobStatus::Pending, .. })
        ));
        assert!(matches!(fx.service.retry(999), Err(RetryError::NotFound(999))));
    }

    #[test]
    fn test_retry_requeues_failed_job() {
        let fx = fixture();
        let id = fx.store.create(b"Raw,1").unwrap();
        fail_job(&fx.store, id);

        let job = fx.service.retry(id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.run, 1);
        assert!(job.failure_reason.is_none());

        let delivery = fx.queue.dequeue(&ShutdownSignal::new()).unwrap().unwrap();
        assert_eq!(delivery.run, 1);
        assert_eq!(delivery.attempt, 0);
    }

    #[test]
    fn test_download_states() {
        let fx = fixture();
        assert!(matches!(fx.service.download(5), Err(DownloadError::NotFound(5))));

        let id = fx.store.create(b"Raw,1").unwrap();
        assert!(matches!(
            fx.service.download(id),
            Err(DownloadError::NotReady { status: JobStatus::Pending, .. })
        ));

        let path = fx.dir.path().join("gnss_test.obs");
        std::fs::write(&path, b"RINEX-DATA").unwrap();
        fx.store
            .transition(id, JobStatus::Pending, JobStatus::Processing, TransitionFields::none())
            .unwrap();
        fx.store
            .transition(
                id,
                JobStatus::Processing,
                JobStatus::Completed,
                TransitionFields::completed(&path),
            )
            .unwrap();

        let download = fx.service.download(id).unwrap();
        assert_eq!(download.bytes, b"RINEX-DATA");
        assert_eq!(download.file_name, "gnss_test.obs");

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            fx.service.download(id),
            Err(DownloadError::ArtifactMissing { .. })
        ));
    }

    #[test]
    fn test_counts_cover_all_statuses() {
        let fx = fixture();
        fx.service.submit(b"Raw,1").unwrap();
        let counts = fx.service.counts().unwrap();
        assert_eq!(counts.len(), 4);
        assert_eq!(counts[0], (JobStatus::Pending, 1));
    }
}
