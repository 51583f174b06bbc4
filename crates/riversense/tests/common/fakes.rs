//! Scripted stand-ins for the converter, the store and artifact storage.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex};

use riversense::convert::{ConversionError, ConversionErrorKind, RinexArtifact, RinexConverter};
use riversense::db::DatabaseError;
use riversense::error::ArtifactError;
use riversense::storage::ArtifactStorage;
use riversense::store::{
    ArtifactAvailability, ArtifactStore, ConversionJob, JobFilter, JobId, JobStatus, Ownership,
    StoreError, TransitionFields,
};

/// Plays back queued results, then succeeds with fixed bytes.
pub struct ScriptedConverter {
    results: Mutex<VecDeque<Result<RinexArtifact, ConversionError>>>,
    output: Vec<u8>,
    calls: AtomicUsize,
}

impl ScriptedConverter {
    pub fn succeeding(output: &[u8]) -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            output: output.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fails `times` times with `kind`, then succeeds with `output`.
    pub fn failing_then(kind: ConversionErrorKind, times: usize, output: &[u8]) -> Self {
        let results = (0..times)
            .map(|i| Err(ConversionError::new(kind, format!("scripted failure {}", i + 1))))
            .collect();
        Self {
            results: Mutex::new(results),
            output: output.to_vec(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RinexConverter for ScriptedConverter {
    fn convert(&self, _raw: &[u8]) -> Result<RinexArtifact, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(RinexArtifact::new(self.output.clone())))
    }
}

/// Always fails with the same kind.
pub struct FailingConverter {
    kind: ConversionErrorKind,
    calls: AtomicUsize,
}

impl FailingConverter {
    pub fn new(kind: ConversionErrorKind) -> Self {
        Self {
            kind,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RinexConverter for FailingConverter {
    fn convert(&self, _raw: &[u8]) -> Result<RinexArtifact, ConversionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(ConversionError::new(self.kind, format!("failure #{}", n)))
    }
}

/// Holds every caller at a barrier before converting, so concurrent
/// handlers overlap inside the conversion step.
pub struct RendezvousConverter {
    barrier: Barrier,
    calls: AtomicUsize,
}

impl RendezvousConverter {
    pub fn new(parties: usize) -> Self {
        Self {
            barrier: Barrier::new(parties),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RinexConverter for RendezvousConverter {
    fn convert(&self, raw: &[u8]) -> Result<RinexArtifact, ConversionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.barrier.wait();
        let mut bytes = b"RINEX:".to_vec();
        bytes.extend_from_slice(raw);
        Ok(RinexArtifact::new(bytes))
    }
}

/// Artifact storage whose first `failures` writes fail.
pub struct FlakyStorage<S> {
    inner: S,
    failures: AtomicUsize,
}

impl<S: ArtifactStorage> FlakyStorage<S> {
    pub fn new(inner: S, failures: usize) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
        }
    }
}

impl<S: ArtifactStorage> ArtifactStorage for FlakyStorage<S> {
    fn write(&self, job: &ConversionJob, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ArtifactError::WriteFile {
                path: PathBuf::from("/unwritable"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.write(job, bytes)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, ArtifactError> {
        self.inner.read(path)
    }
}

/// A store whose database is gone.
pub struct UnavailableStore;

fn down() -> StoreError {
    StoreError::Storage(DatabaseError::LockPoisoned)
}

impl ArtifactStore for UnavailableStore {
    fn create(&self, _raw_payload: &[u8]) -> Result<JobId, StoreError> {
        Err(down())
    }

    fn get(&self, _id: JobId) -> Result<ConversionJob, StoreError> {
        Err(down())
    }

    fn transition(
        &self,
        _id: JobId,
        _expected: JobStatus,
        _next: JobStatus,
        _fields: TransitionFields,
    ) -> Result<ConversionJob, StoreError> {
        Err(down())
    }

    fn transition_owned(
        &self,
        _id: JobId,
        _held: &Ownership,
        _next: JobStatus,
        _fields: TransitionFields,
    ) -> Result<ConversionJob, StoreError> {
        Err(down())
    }

    fn find_by_artifact_availability(&self, _id: JobId) -> Result<ArtifactAvailability, StoreError> {
        Err(down())
    }

    fn list(&self, _filter: &JobFilter) -> Result<Vec<ConversionJob>, StoreError> {
        Err(down())
    }

    fn count_by_status(&self, _status: JobStatus) -> Result<u64, StoreError> {
        Err(down())
    }
}
