//! Job worker: polls the queue and runs a handler with bounded concurrency.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::services::queue::JobQueue;
use crate::types::{Job, JobFailure, JobType};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// What to do with a job after a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done; remove the job
    Completed,
    /// Poll again later without consuming a retry attempt
    Reschedule(Duration),
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    /// `Err` goes through the queue's retry budget.
    async fn handle(&self, job: &Job) -> Result<JobOutcome>;
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, config: QueueConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Poll until `shutdown` flips to true, then wait for in-flight jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let job_type = self.handler.job_type();
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        info!("Worker for {} started (concurrency {})", job_type, concurrency);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    let stop = changed.is_err() || *shutdown.borrow();
                    if stop {
                        info!("Worker for {} received shutdown signal", job_type);
                        break;
                    }
                    continue;
                }
            }

            let available = semaphore.available_permits();
            if available == 0 {
                continue;
            }

            let jobs = match self.queue.claim_due(job_type, available).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!("Failed to claim {} jobs: {}", job_type, e);
                    continue;
                }
            };

            for job in jobs {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let queue = self.queue.clone();
                let handler = self.handler.clone();
                tokio::spawn(async move {
                    process_job(queue.as_ref(), handler.as_ref(), job).await;
                    drop(permit);
                });
            }
        }

        // Let in-flight jobs finish.
        let _ = semaphore.acquire_many(concurrency as u32).await;
        info!("Worker for {} stopped", job_type);
    }

    /// Claim and process every job that is due right now, one at a time.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        loop {
            let jobs = self.queue.claim_due(self.handler.job_type(), 1).await?;
            let Some(job) = jobs.into_iter().next() else {
                return Ok(processed);
            };
            process_job(self.queue.as_ref(), self.handler.as_ref(), job).await;
            processed += 1;
        }
    }
}

/// Run one job and report its outcome back to the queue.
pub async fn process_job(queue: &dyn JobQueue, handler: &dyn JobHandler, job: Job) {
    let result = handler.handle(&job).await;

    let reported = match result {
        Ok(JobOutcome::Completed) => queue.complete(&job.id).await,
        Ok(JobOutcome::Reschedule(delay)) => {
            debug!("Job {} rescheduled in {:?}", job.id, delay);
            queue.reschedule_delayed(&job.id, delay).await
        }
        Err(e) if !e.is_transient() => {
            error!("Job {} failed permanently: {}", job.id, e);
            queue.complete(&job.id).await
        }
        Err(e) => match queue.fail(&job.id, &e.to_string()).await {
            Ok(JobFailure::Retrying { attempt, delay }) => {
                warn!(
                    "Job {} attempt {} failed, retrying in {:?}: {}",
                    job.id, attempt, delay, e
                );
                Ok(())
            }
            Ok(JobFailure::Exhausted { attempts }) => {
                error!("Job {} exhausted {} attempts: {}", job.id, attempts, e);
                Ok(())
            }
            Err(qe) => Err(qe),
        },
    };

    if let Err(e) = reported {
        error!("Failed to report outcome of job {}: {}", job.id, e);
    }
}
