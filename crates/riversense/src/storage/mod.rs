pub mod filesystem;

use std::path::{Path, PathBuf};

use crate::error::ArtifactError;
use crate::store::ConversionJob;

pub use filesystem::FileArtifactStorage;

/// Where finished RINEX files live.
pub trait ArtifactStorage: Send + Sync {
    /// Writes the artifact for `job` and returns its final path. Writing the
    /// same job twice replaces the file at the same path.
    fn write(&self, job: &ConversionJob, bytes: &[u8]) -> Result<PathBuf, ArtifactError>;

    fn read(&self, path: &Path) -> Result<Vec<u8>, ArtifactError>;
}
