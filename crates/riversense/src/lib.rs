pub mod app;
pub mod config;
pub mod convert;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use app::App;
pub use config::{load_config, Config};
pub use convert::{ConversionError, ConversionErrorKind, GnssLoggerConverter, RinexArtifact, RinexConverter};
pub use error::{ArtifactError, ConfigError, Result, RiversenseError, WorkerError};
pub use pipeline::{ConversionService, Download, Orchestrator, Outcome, RetryPolicy};
pub use queue::{Delivery, JobQueue, ShutdownSignal, SqliteJobQueue};
pub use storage::{ArtifactStorage, FileArtifactStorage};
pub use store::{ArtifactStore, ConversionJob, JobId, JobStatus, SqliteArtifactStore};
pub use worker::{JobReport, WorkerPool};
