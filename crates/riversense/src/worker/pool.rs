use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::pipeline::Orchestrator;
use crate::queue::{Delivery, JobQueue, QueueError, ShutdownSignal};
use crate::worker::report::JobReport;

/// Pause after a failed dequeue before trying the queue again.
const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Fixed set of threads consuming the job queue.
pub struct WorkerPool {
    report_receiver: Receiver<JobReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: ShutdownSignal,
}

impl WorkerPool {
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn JobQueue>,
        worker_count: usize,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::SpawnFailed(
                "worker_count must be > 0".to_string(),
            ));
        }

        let (report_sender, report_receiver) = bounded::<JobReport>(worker_count * 16);
        let shutdown = ShutdownSignal::new();
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let orchestrator = Arc::clone(&orchestrator);
            let queue = Arc::clone(&queue);
            let report_tx = report_sender.clone();
            let shutdown_signal = shutdown.clone();

            let spawned = thread::Builder::new()
                .name(format!("riversense-worker-{}", worker_id))
                .spawn(move || {
                    run_worker(worker_id, orchestrator, queue, report_tx, shutdown_signal);
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.trigger();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        info!("Started {} workers", worker_count);

        Ok(Self {
            report_receiver,
            workers,
            shutdown,
        })
    }

    /// Reports are dropped when nobody drains them; workers never block on
    /// this channel.
    pub fn try_recv_report(&self) -> Option<JobReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<JobReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.trigger();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Blocks until every worker has finished its current delivery and exited.
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn JobQueue>,
    report_sender: Sender<JobReport>,
    shutdown: ShutdownSignal,
) {
    debug!("Worker {} started", worker_id);

    loop {
        let delivery = match queue.dequeue(&shutdown) {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                debug!("Worker {} received shutdown signal", worker_id);
                break;
            }
            Err(e) => {
                error!("Worker {} could not dequeue: {}", worker_id, e);
                pause(&shutdown, DEQUEUE_ERROR_BACKOFF);
                continue;
            }
        };

        let report = process(worker_id, &orchestrator, queue.as_ref(), &delivery);

        match report_sender.try_send(report) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {
                debug!("Worker {} report channel closed", worker_id);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

fn process(
    worker_id: usize,
    orchestrator: &Orchestrator,
    queue: &dyn JobQueue,
    delivery: &Delivery,
) -> JobReport {
    debug!(
        "Worker {} handling job {} (attempt {})",
        worker_id, delivery.job_id, delivery.attempt
    );

    let mut report = JobReport {
        worker_id,
        job_id: delivery.job_id,
        attempt: delivery.attempt,
        outcome: None,
        error: None,
    };

    match orchestrator.handle(delivery) {
        Ok(outcome) => {
            match queue.ack(delivery) {
                Ok(()) => {}
                Err(QueueError::LeaseLost { message_id }) => {
                    warn!(
                        "Worker {} lost the lease on message {} for job {}",
                        worker_id, message_id, delivery.job_id
                    );
                }
                Err(e) => {
                    error!("Worker {} could not ack job {}: {}", worker_id, delivery.job_id, e);
                }
            }
            report.outcome = Some(outcome);
        }
        Err(e) => {
            error!(
                "Worker {} failed job {}, leaving it for redelivery: {}",
                worker_id, delivery.job_id, e
            );
            report.error = Some(e.to_string());
        }
    }

    report
}

fn pause(shutdown: &ShutdownSignal, total: Duration) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < total && !shutdown.is_triggered() {
        thread::sleep(step);
        waited += step;
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::convert::{ConversionError, RinexArtifact, RinexConverter};
    use crate::db::Database;
    use crate::pipeline::{ConversionService, Outcome, RetryPolicy};
    use crate::queue::SqliteJobQueue;
    use crate::storage::FileArtifactStorage;
    use crate::store::{ArtifactStore, JobStatus, SqliteArtifactStore};

    struct EchoConverter;

    impl RinexConverter for EchoConverter {
        fn convert(&self, raw: &[u8]) -> Result<RinexArtifact, ConversionError> {
            if raw.is_empty() {
                return Err(ConversionError::malformed("empty payload"));
            }
            Ok(RinexArtifact::new(raw.to_vec()))
        }
    }

    fn setup(dir: &TempDir) -> (Arc<SqliteArtifactStore>, Arc<SqliteJobQueue>, Arc<Orchestrator>) {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(SqliteArtifactStore::new(db.clone()));
        let queue = Arc::new(SqliteJobQueue::new(
            db,
            Duration::from_secs(60),
            Duration::from_millis(20),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            queue.clone(),
            Arc::new(EchoConverter),
            Arc::new(FileArtifactStorage::new(dir.path())),
            RetryPolicy::default(),
        ));
        (store, queue, orchestrator)
    }

    #[test]
    fn test_worker_pool_creation() {
        let dir = TempDir::new().unwrap();
        let (_store, queue, orchestrator) = setup(&dir);

        let pool = WorkerPool::start(orchestrator, queue, 2).unwrap();
        assert!(!pool.is_shutdown());

        pool.shutdown();
        assert!(pool.is_shutdown());
        pool.wait();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let dir = TempDir::new().unwrap();
        let (_store, queue, orchestrator) = setup(&dir);
        assert!(WorkerPool::start(orchestrator, queue, 0).is_err());
    }

    #[test]
    fn test_pool_drains_queue() {
        let dir = TempDir::new().unwrap();
        let (store, queue, orchestrator) = setup(&dir);
        let service = ConversionService::new(
            store.clone(),
            queue.clone(),
            Arc::new(FileArtifactStorage::new(dir.path())),
        );

        let ids: Vec<_> = (0..6)
            .map(|i| service.submit(format!("Raw,{}", i).as_bytes()).unwrap())
            .collect();
        let bad = service.submit(b"").unwrap();

        let pool = WorkerPool::start(orchestrator, queue.clone(), 3).unwrap();

        let mut reports = Vec::new();
        while reports.len() < ids.len() + 1 {
            let report = pool
                .recv_report_timeout(Duration::from_secs(10))
                .expect("worker report");
            reports.push(report);
        }
        pool.shutdown();
        pool.wait();

        assert!(reports.iter().all(JobReport::succeeded));
        for id in ids {
            let job = store.get(id).unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            let bytes = std::fs::read(job.artifact_path.unwrap()).unwrap();
            assert_eq!(bytes, format!("Raw,{}", id - 1).into_bytes());
        }
        assert_eq!(store.get(bad).unwrap().status, JobStatus::Failed);
        assert!(reports
            .iter()
            .any(|r| r.job_id == bad && matches!(r.outcome, Some(Outcome::Failed { .. }))));
        assert_eq!(queue.depth().unwrap(), 0);
    }
}
