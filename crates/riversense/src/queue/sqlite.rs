use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, trace, warn};
use uuid::Uuid;

use crate::db::queue_repo;
use crate::db::{Database, DatabaseError};
use crate::store::JobId;

use super::{Delivery, JobQueue, QueueError, ShutdownSignal};

/// Longest a blocked consumer sleeps before re-checking the shutdown flag.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Queue backed by the `queue` table of the shared database.
pub struct SqliteJobQueue {
    db: Database,
    lease_duration: Duration,
    poll_interval: Duration,
    closed: AtomicBool,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
}

impl SqliteJobQueue {
    pub fn new(db: Database, lease_duration: Duration, poll_interval: Duration) -> Self {
        let (notify_tx, notify_rx) = bounded(64);
        Self {
            db,
            lease_duration,
            poll_interval,
            closed: AtomicBool::new(false),
            notify_tx,
            notify_rx,
        }
    }

    /// Stops accepting new messages. Dequeue and ack keep working so
    /// in-flight deliveries can finish.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Number of messages not yet acknowledged.
    pub fn depth(&self) -> Result<u64, QueueError> {
        queue_repo::count(&self.db).map_err(unavailable)
    }

    fn try_claim(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let lease_until = now.saturating_add(self.lease_duration.as_millis() as i64);
        let token = Uuid::new_v4().to_string();

        let row = queue_repo::claim_next(&self.db, now, lease_until, &token).map_err(unavailable)?;

        Ok(row.map(|row| Delivery {
            message_id: row.id,
            job_id: row.job_id,
            run: row.run,
            attempt: row.attempt,
            deliveries: row.deliveries,
            lease_token: token,
        }))
    }

    /// Sleeps up to `poll_interval`, waking early on an enqueue or shutdown.
    fn wait_for_work(&self, shutdown: &ShutdownSignal) {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            if shutdown.is_triggered() {
                return;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self
                .notify_rx
                .recv_timeout(remaining.min(SHUTDOWN_CHECK_INTERVAL))
            {
                Ok(()) => return,
                Err(RecvTimeoutError::Timeout) => continue,
                // Unreachable while self holds the sender.
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }
}

fn unavailable(e: DatabaseError) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

impl JobQueue for SqliteJobQueue {
    fn enqueue_delayed(
        &self,
        job_id: JobId,
        run: u32,
        attempt: u32,
        delay: Duration,
    ) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Unavailable("queue is closed".to_string()));
        }

        let now = Utc::now().timestamp_millis();
        let visible_at = now.saturating_add(delay.as_millis() as i64);
        let message_id =
            queue_repo::insert(&self.db, job_id, run, attempt, visible_at, now).map_err(unavailable)?;

        debug!(
            "Enqueued message {} for job {} (run {}, attempt {}, delay {:?})",
            message_id, job_id, run, attempt, delay
        );

        if delay.is_zero() {
            // Full means consumers already have pending wake-ups.
            let _ = self.notify_tx.try_send(());
        }
        Ok(())
    }

    fn dequeue(&self, shutdown: &ShutdownSignal) -> Result<Option<Delivery>, QueueError> {
        loop {
            if shutdown.is_triggered() {
                return Ok(None);
            }

            if let Some(delivery) = self.try_claim()? {
                if delivery.is_redelivery() {
                    warn!(
                        "Redelivering message {} for job {} (delivery {})",
                        delivery.message_id, delivery.job_id, delivery.deliveries
                    );
                } else {
                    trace!("Leased message {} for job {}", delivery.message_id, delivery.job_id);
                }
                return Ok(Some(delivery));
            }

            self.wait_for_work(shutdown);
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let deleted = queue_repo::delete_leased(&self.db, delivery.message_id, &delivery.lease_token)
            .map_err(unavailable)?;

        if deleted {
            trace!("Acked message {}", delivery.message_id);
            Ok(())
        } else {
            Err(QueueError::LeaseLost {
                message_id: delivery.message_id,
            })
        }
    }
}
