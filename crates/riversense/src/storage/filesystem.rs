use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::ArtifactError;
use crate::store::ConversionJob;

use super::ArtifactStorage;

/// Default directory for RINEX artifacts.
pub const DEFAULT_ARTIFACT_DIRECTORY: &str = "/data/rinex_files";

/// File name of a job's artifact: `gnss_<id>_<created %Y%m%d_%H%M%S>.obs`.
/// Depends only on immutable job fields, so every run of a job targets the
/// same file.
pub fn artifact_file_name(job: &ConversionJob) -> String {
    format!(
        "gnss_{:08}_{}.obs",
        job.id,
        job.created_at.format("%Y%m%d_%H%M%S")
    )
}

/// Stores artifacts as flat files in one output directory.
pub struct FileArtifactStorage {
    output_directory: PathBuf,
}

impl FileArtifactStorage {
    pub fn new<P: AsRef<Path>>(output_directory: P) -> Self {
        Self {
            output_directory: output_directory.as_ref().to_path_buf(),
        }
    }

    pub fn output_directory(&self) -> &Path {
        &self.output_directory
    }

    fn ensure_directory(&self) -> Result<(), ArtifactError> {
        if !self.output_directory.exists() {
            std::fs::create_dir_all(&self.output_directory).map_err(|e| {
                ArtifactError::CreateDirectory {
                    path: self.output_directory.clone(),
                    source: e,
                }
            })?;
        }
        Ok(())
    }
}

impl ArtifactStorage for FileArtifactStorage {
    fn write(&self, job: &ConversionJob, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        self.ensure_directory()?;

        let path = self.output_directory.join(artifact_file_name(job));
        let write_err = |source| ArtifactError::WriteFile {
            path: path.clone(),
            source,
        };

        // Readers see either no file or the complete file.
        let mut tmp = tempfile::Builder::new()
            .prefix(".gnss_")
            .suffix(".partial")
            .tempfile_in(&self.output_directory)
            .map_err(write_err)?;
        tmp.write_all(bytes).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&path).map_err(|e| write_err(e.error))?;

        log::debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, ArtifactError> {
        std::fs::read(path).map_err(|e| ArtifactError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
