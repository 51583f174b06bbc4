//! Test harness for isolated pipeline runs.
//!
//! Each harness owns a temp directory with an artifact directory and a file
//! database, so store and queue behave exactly as in production while tests
//! drive deliveries by hand.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use riversense::convert::RinexConverter;
use riversense::db::Database;
use riversense::pipeline::{ConversionService, Orchestrator, Outcome, RetryPolicy};
use riversense::queue::{Delivery, JobQueue, ShutdownSignal, SqliteJobQueue};
use riversense::storage::{ArtifactStorage, FileArtifactStorage};
use riversense::store::SqliteArtifactStore;

pub struct TestHarness {
    temp_dir: TempDir,
    pub artifact_dir: PathBuf,
    pub db: Database,
    pub store: Arc<SqliteArtifactStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub artifacts: Arc<FileArtifactStorage>,
    pub shutdown: ShutdownSignal,
}

impl TestHarness {
    /// Harness with a long lease, so nothing is redelivered unless a test
    /// asks for it.
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(60))
    }

    pub fn with_lease(lease: Duration) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let artifact_dir = temp_dir.path().join("rinex_files");
        let db = Database::open(&temp_dir.path().join("riversense.db"))
            .expect("Failed to open test database");

        let store = Arc::new(SqliteArtifactStore::new(db.clone()));
        let queue = Arc::new(SqliteJobQueue::new(
            db.clone(),
            lease,
            Duration::from_millis(10),
        ));
        let artifacts = Arc::new(FileArtifactStorage::new(&artifact_dir));

        Self {
            temp_dir,
            artifact_dir,
            db,
            store,
            queue,
            artifacts,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn service(&self) -> ConversionService {
        ConversionService::new(self.store.clone(), self.queue.clone(), self.artifacts.clone())
    }

    /// Retry policy without backoff delays.
    pub fn fast_retry_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    pub fn orchestrator(&self, converter: Arc<dyn RinexConverter>) -> Orchestrator {
        self.orchestrator_with(converter, Self::fast_retry_policy())
    }

    pub fn orchestrator_with(
        &self,
        converter: Arc<dyn RinexConverter>,
        policy: RetryPolicy,
    ) -> Orchestrator {
        self.orchestrator_with_storage(converter, self.artifacts.clone(), policy)
    }

    pub fn orchestrator_with_storage(
        &self,
        converter: Arc<dyn RinexConverter>,
        artifacts: Arc<dyn ArtifactStorage>,
        policy: RetryPolicy,
    ) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.queue.clone(),
            converter,
            artifacts,
            policy,
        )
    }

    /// Leases the next visible message, waiting for delayed ones.
    pub fn next_delivery(&self) -> Delivery {
        self.queue
            .dequeue(&self.shutdown)
            .expect("dequeue failed")
            .expect("queue shut down")
    }

    /// Handles deliveries like a single worker until the queue is empty.
    /// Deliveries that fail are left for redelivery, as a worker would.
    pub fn drain(&self, orchestrator: &Orchestrator) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while self.queue.depth().expect("queue depth") > 0 {
            let delivery = self.next_delivery();
            match orchestrator.handle(&delivery) {
                Ok(outcome) => {
                    self.queue.ack(&delivery).expect("ack failed");
                    outcomes.push(outcome);
                }
                Err(e) => panic!("delivery for job {} failed: {}", delivery.job_id, e),
            }
        }
        outcomes
    }

    /// Writes an `sh` script that acts as the external converter. The
    /// script is invoked as `sh <script> -o <output> <staging>`.
    pub fn write_script(&self, name: &str, body: &str) -> Vec<String> {
        let path = self.temp_dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("Failed to write script");
        vec!["sh".to_string(), path.to_string_lossy().into_owned()]
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
