use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore, watch};
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::runner::ProcessRunner;
use crate::db::models::{JobOutcome, JobRecord};
use crate::db::{JobStore, StoreError};
use crate::api::job::models::JobStatus;
use crate::processes::ProcessRegistry;

/// First pause before re-trying a failed terminal write
const WRITE_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const WRITE_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Background worker for executing accepted jobs
#[derive(Clone)]
pub struct JobWorker {
    store: JobStore,
    processes: Arc<ProcessRegistry>,
    runner: Arc<ProcessRunner>,
    wake: Arc<Notify>,
    poll_interval: Duration,
}

impl JobWorker {
    /// Create a new JobWorker instance
    pub fn new(
        store: JobStore,
        processes: Arc<ProcessRegistry>,
        runner: Arc<ProcessRunner>,
        wake: Arc<Notify>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            processes,
            runner,
            wake,
            poll_interval,
        }
    }

    /// Run worker with semaphore-based bounded concurrency
    ///
    /// # Architecture
    /// - Acquires a semaphore permit before claiming a job, so a job only
    ///   becomes `running` when there is capacity to run it
    /// - Claims the oldest accepted job; the claim is the single point of ownership
    /// - Runs it to a terminal outcome and writes that back
    /// - Waits for a submission wake-up or the poll interval when idle
    /// - Stops claiming jobs once shutdown is signalled; a job in flight finishes first
    pub async fn run(
        &self,
        worker_id: u32,
        semaphore: Arc<Semaphore>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Worker {} started", worker_id);

        loop {
            if *shutdown_rx.borrow() {
                info!("Worker {} received shutdown signal, stopping", worker_id);
                break;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Worker {} failed to acquire semaphore: {:?}", worker_id, e);
                    break;
                }
            };

            match self.store.acquire_next().await {
                Ok(Some(job)) => {
                    info!("Worker {} acquired job: id={}, process={}", worker_id, job.id, job.process_id);
                    self.process(job, &mut shutdown_rx).await;
                    drop(permit);
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = sleep(self.poll_interval) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Worker {} encountered store error: {:?}", worker_id, e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Execute a claimed job and record its terminal state
    ///
    /// A failed write is retried until it lands, so a finished job does not
    /// stay `running`. Only shutdown interrupts the retries; the job is then
    /// failed as interrupted on the next start.
    pub async fn process(&self, job: JobRecord, shutdown_rx: &mut watch::Receiver<bool>) {
        let outcome = match self.processes.get(&job.process_id) {
            Some(process) => self.runner.run(&job, process).await,
            None => JobOutcome::failure(
                "UnknownProcess",
                format!("Process {} is no longer available", job.process_id),
                self.runner.result_location(job.id),
            ),
        };

        let status = outcome.status();
        let store = &self.store;
        let written = write_terminal(job.id, WRITE_RETRY_BASE_DELAY, shutdown_rx, || {
            store.complete(job.id, outcome.clone())
        })
        .await;
        match written {
            Ok(_) => info!("Completed job {}: status={}", job.id, status),
            Err(e) => error!("Failed to record outcome of job {}: {:?}", job.id, e),
        }
    }
}

/// Run `write` until it succeeds, retrying transient store errors with backoff
///
/// Returns early on errors a retry cannot fix (an unknown job or a transition
/// the job no longer allows) and once shutdown is signalled.
pub async fn write_terminal<F, Fut>(
    job_id: Uuid,
    base_delay: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
    mut write: F,
) -> Result<JobRecord, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobRecord, StoreError>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;
    loop {
        let e = match write().await {
            Ok(job) => return Ok(job),
            Err(e @ (StoreError::NotFound(_) | StoreError::InvalidTransition { .. })) => return Err(e),
            Err(e) => e,
        };
        if *shutdown_rx.borrow() {
            return Err(e);
        }

        warn!(
            "Attempt {} to record outcome of job {} failed, retrying in {:?}: {}",
            attempt, job_id, delay, e
        );
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown_rx.changed() => return Err(e),
        }
        delay = delay.saturating_mul(2).min(WRITE_RETRY_MAX_DELAY);
        attempt += 1;
    }
}

/// Fail jobs left `running` by a previous process
///
/// Their execution state is unknown, so they are never re-run; accepted jobs
/// remain queued and are picked up normally.
pub async fn recover_interrupted(store: &JobStore, runner: &ProcessRunner) -> Result<u64, StoreError> {
    let interrupted = store.list(Some(JobStatus::Running), i64::MAX).await?;
    let mut recovered = 0;
    for job in interrupted {
        warn!("Job {} was interrupted by a restart, marking it failed", job.id);
        let outcome = JobOutcome::failure(
            "Interrupted",
            "The execution service restarted while this job was running",
            runner.result_location(job.id),
        );
        match store.complete(job.id, outcome).await {
            Ok(_) => recovered += 1,
            Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(recovered)
}
