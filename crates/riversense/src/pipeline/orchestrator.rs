//! Per-delivery state machine driving a job from Pending to a terminal state.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, info_span, warn};

use crate::convert::{ConversionError, RinexArtifact, RinexConverter};
use crate::queue::{Delivery, JobQueue};
use crate::storage::ArtifactStorage;
use crate::store::{
    ArtifactStore, ConversionJob, JobStatus, Ownership, StoreError, TransitionFields,
};

use super::error::PipelineError;
use super::retry::{RetryDecision, RetryPolicy};
use super::RETRIES_EXHAUSTED;

/// What a delivery did to its job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed { path: PathBuf },
    Failed { reason: String },
    Retrying { next_attempt: u32, delay: Duration },
    Skipped(SkipReason),
}

/// Why a delivery was dropped without touching its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    JobMissing,
    /// Another worker claimed the job first.
    AlreadyClaimed,
    /// Duplicate of a delivery another worker is running.
    Duplicate,
    /// Left over from an earlier run, or from an attempt that was already
    /// retried.
    Stale,
    Terminal(JobStatus),
    /// The job changed underneath this run before its result was recorded.
    LostRace,
}

enum Claim {
    Owned(ConversionJob),
    Skip(SkipReason),
}

pub struct Orchestrator {
    store: Arc<dyn ArtifactStore>,
    queue: Arc<dyn JobQueue>,
    converter: Arc<dyn RinexConverter>,
    artifacts: Arc<dyn ArtifactStorage>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        queue: Arc<dyn JobQueue>,
        converter: Arc<dyn RinexConverter>,
        artifacts: Arc<dyn ArtifactStorage>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            converter,
            artifacts,
            retry,
        }
    }

    /// Runs one delivery. Every durable effect has happened when this
    /// returns `Ok`, so the caller may acknowledge the delivery. On `Err`
    /// the caller must not acknowledge it.
    pub fn handle(&self, delivery: &Delivery) -> Result<Outcome, PipelineError> {
        let _span = info_span!(
            "delivery",
            job_id = delivery.job_id,
            attempt = delivery.attempt,
            deliveries = delivery.deliveries,
        )
        .entered();

        let job = match self.claim(delivery)? {
            Claim::Owned(job) => job,
            Claim::Skip(reason) => {
                debug!("Skipping delivery: {:?}", reason);
                return Ok(Outcome::Skipped(reason));
            }
        };

        let converted = {
            let _span = info_span!("convert", bytes = job.raw_payload.len()).entered();
            self.converter.convert(&job.raw_payload)
        };

        match converted {
            Ok(artifact) => self.complete(&job, artifact),
            Err(err) => self.handle_conversion_error(&job, err),
        }
    }

    /// Makes this delivery the owner of the job's current attempt. Every
    /// later write of the attempt is guarded on that ownership.
    fn claim(&self, delivery: &Delivery) -> Result<Claim, PipelineError> {
        let job = match self.store.get(delivery.job_id) {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => return Ok(Claim::Skip(SkipReason::JobMissing)),
            Err(e) => return Err(e.into()),
        };

        let held = Ownership::of(&job);
        let owned = TransitionFields::owned_by(&delivery.lease_token);

        let claimed = match job.status {
            JobStatus::Completed | JobStatus::Failed => {
                return Ok(Claim::Skip(SkipReason::Terminal(job.status)))
            }
            _ if delivery.run != job.run => return Ok(Claim::Skip(SkipReason::Stale)),
            JobStatus::Pending if delivery.attempt > 0 => {
                return Ok(Claim::Skip(SkipReason::Stale))
            }
            JobStatus::Pending => {
                self.store
                    .transition_owned(job.id, &held, JobStatus::Processing, owned)
            }
            JobStatus::Processing => match delivery.attempt.cmp(&job.attempts) {
                Ordering::Less => return Ok(Claim::Skip(SkipReason::Stale)),
                // A first delivery only picks up a scheduled retry nobody owns
                // yet. Redeliveries take over from an owner whose lease expired.
                Ordering::Equal
                    if !delivery.is_redelivery()
                        && (delivery.attempt == 0 || job.owner.is_some()) =>
                {
                    return Ok(Claim::Skip(SkipReason::Duplicate))
                }
                Ordering::Equal => {
                    self.store
                        .transition_owned(job.id, &held, JobStatus::Processing, owned)
                }
                // Queued by an owner that stopped before recording the attempt.
                Ordering::Greater => self.store.transition_owned(
                    job.id,
                    &held,
                    JobStatus::Processing,
                    owned.with_attempts(delivery.attempt),
                ),
            },
        };

        Ok(match settle(claimed)? {
            Some(job) => {
                debug!("Delivery owns job {} attempt {}", job.id, job.attempts);
                Claim::Owned(job)
            }
            None => Claim::Skip(SkipReason::AlreadyClaimed),
        })
    }

    /// False once another delivery took the attempt over or the job moved on.
    fn still_owned(&self, job: &ConversionJob) -> Result<bool, PipelineError> {
        match self.store.get(job.id) {
            Ok(current) => Ok(Ownership::of(&current) == Ownership::of(job)),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn complete(&self, job: &ConversionJob, artifact: RinexArtifact) -> Result<Outcome, PipelineError> {
        if !self.still_owned(job)? {
            return Ok(Outcome::Skipped(SkipReason::LostRace));
        }

        let path = {
            let _span = info_span!("write_artifact", bytes = artifact.bytes.len()).entered();
            self.artifacts.write(job, &artifact.bytes)?
        };

        let completed = self.store.transition_owned(
            job.id,
            &Ownership::of(job),
            JobStatus::Completed,
            TransitionFields::completed(&path),
        );
        Ok(match settle(completed)? {
            Some(_) => {
                info!("Job {} completed: {}", job.id, path.display());
                Outcome::Completed { path }
            }
            None => Outcome::Skipped(SkipReason::LostRace),
        })
    }

    fn handle_conversion_error(
        &self,
        job: &ConversionJob,
        err: ConversionError,
    ) -> Result<Outcome, PipelineError> {
        let attempt = job.attempts;
        match self.retry.decide(err.kind, attempt) {
            RetryDecision::Permanent => {
                warn!("Job {} cannot be converted: {}", job.id, err);
                self.fail(job, err.to_string())
            }
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                if !self.still_owned(job)? {
                    return Ok(Outcome::Skipped(SkipReason::LostRace));
                }
                warn!(
                    "Job {} attempt {} failed ({}); retrying in {:?}",
                    job.id, attempt, err, delay
                );
                // Queue first: a crash between the two steps leaves a
                // resumable message rather than a job with no work.
                self.queue
                    .enqueue_delayed(job.id, job.run, next_attempt, delay)?;

                // Releases ownership: the next attempt belongs to whichever
                // delivery picks up the new message.
                let recorded = self.store.transition_owned(
                    job.id,
                    &Ownership::of(job),
                    JobStatus::Processing,
                    TransitionFields::attempts(next_attempt),
                );
                Ok(match settle(recorded)? {
                    Some(_) => Outcome::Retrying {
                        next_attempt,
                        delay,
                    },
                    None => Outcome::Skipped(SkipReason::LostRace),
                })
            }
            RetryDecision::Exhausted => {
                warn!(
                    "Job {} failed after {} retries, last error: {}",
                    job.id, attempt, err
                );
                self.fail(job, RETRIES_EXHAUSTED.to_string())
            }
        }
    }

    fn fail(&self, job: &ConversionJob, reason: String) -> Result<Outcome, PipelineError> {
        let failed = self.store.transition_owned(
            job.id,
            &Ownership::of(job),
            JobStatus::Failed,
            TransitionFields::failed(reason.clone()),
        );
        Ok(match settle(failed)? {
            Some(_) => Outcome::Failed { reason },
            None => Outcome::Skipped(SkipReason::LostRace),
        })
    }
}

/// Maps a lost compare-and-swap to `None`; other store errors propagate.
fn settle(result: Result<ConversionJob, StoreError>) -> Result<Option<ConversionJob>, PipelineError> {
    match result {
        Ok(job) => Ok(Some(job)),
        Err(e) if e.is_conflict() => {
            debug!("Lost transition race: {}", e);
            Ok(None)
        }
        Err(StoreError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
