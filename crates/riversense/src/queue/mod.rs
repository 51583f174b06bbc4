//! Job queue: durable, leased delivery of conversion work to workers.
//!
//! Messages carry a job id plus the run and attempt they were scheduled for.
//! A consumer that dequeues a message holds a lease on it; if the lease
//! expires before the message is acknowledged it becomes visible again and
//! is delivered to another consumer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::store::JobId;

pub mod sqlite;

pub use sqlite::SqliteJobQueue;

/// One leased delivery of a queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: i64,
    pub job_id: JobId,
    /// Run of the job this message belongs to.
    pub run: u32,
    /// Retry attempt this message was scheduled for (0 for the first run).
    pub attempt: u32,
    /// How many times this message has been leased, including this one.
    pub deliveries: u32,
    pub lease_token: String,
}

impl Delivery {
    /// True when an earlier lease on this message expired unacknowledged.
    pub fn is_redelivery(&self) -> bool {
        self.deliveries > 1
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("lease on message {message_id} was lost before acknowledgement")]
    LeaseLost { message_id: i64 },
}

/// Cooperative stop flag shared between a worker pool and its consumers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub trait JobQueue: Send + Sync {
    /// Schedules the first attempt of `run`, visible immediately.
    fn enqueue(&self, job_id: JobId, run: u32) -> Result<(), QueueError> {
        self.enqueue_delayed(job_id, run, 0, Duration::ZERO)
    }

    /// Schedules `attempt` of `run`, visible after `delay`.
    fn enqueue_delayed(
        &self,
        job_id: JobId,
        run: u32,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Blocks until a message can be leased. Returns `None` once `shutdown`
    /// is triggered.
    fn dequeue(&self, shutdown: &ShutdownSignal) -> Result<Option<Delivery>, QueueError>;

    /// Removes a delivered message. Fails with `LeaseLost` when the lease
    /// expired and the message was handed to someone else.
    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}
