//! Wiring of the pipeline components from a [`Config`].

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db::Database;
use crate::error::{ConfigError, Result, RiversenseError};
use crate::pipeline::{ConversionService, Orchestrator};
use crate::queue::SqliteJobQueue;
use crate::storage::FileArtifactStorage;
use crate::store::SqliteArtifactStore;
use crate::worker::WorkerPool;

/// Shared handles for one process. Store and queue share a database.
pub struct App {
    pub config: Config,
    pub store: Arc<SqliteArtifactStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub artifacts: Arc<FileArtifactStorage>,
}

impl App {
    pub fn open(config: Config) -> Result<Self> {
        let db_path = config.database_path().ok_or_else(|| ConfigError::Validation {
            message: "no database_path configured and no home directory found".to_string(),
        })?;
        let db = Database::open(&db_path)?;
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: Config, db: Database) -> Self {
        let queue = SqliteJobQueue::new(
            db.clone(),
            config.queue.lease_duration(),
            config.queue.poll_interval(),
        );
        let artifacts = FileArtifactStorage::new(config.artifact_directory());

        Self {
            store: Arc::new(SqliteArtifactStore::new(db)),
            queue: Arc::new(queue),
            artifacts: Arc::new(artifacts),
            config,
        }
    }

    pub fn artifact_directory(&self) -> &Path {
        self.artifacts.output_directory()
    }

    pub fn service(&self) -> ConversionService {
        ConversionService::new(self.store.clone(), self.queue.clone(), self.artifacts.clone())
    }

    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let converter = self.config.converter().ok_or_else(|| ConfigError::Validation {
            message: "converter.command must name a program".to_string(),
        })?;

        Ok(Orchestrator::new(
            self.store.clone(),
            self.queue.clone(),
            Arc::new(converter),
            self.artifacts.clone(),
            self.config.retry_policy(),
        ))
    }

    pub fn start_workers(&self) -> Result<WorkerPool> {
        let orchestrator = Arc::new(self.orchestrator()?);
        WorkerPool::start(orchestrator, self.queue.clone(), self.config.worker_count)
            .map_err(RiversenseError::from)
    }
}
