//! Delayed job queue.
//!
//! At-least-once delivery: a claimed job runs until the worker reports
//! `complete`, `reschedule_delayed` or `fail`. Handlers must be idempotent.

use crate::error::Result;
use crate::types::{Job, JobFailure, JobOptions, JobState, JobType};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns the job id; if a live job already has the requested
    /// id nothing is added and that id is returned.
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<String>;

    /// Put a claimed job back to wait for `delay`. Does not consume an attempt.
    async fn reschedule_delayed(&self, job_id: &str, delay: Duration) -> Result<()>;

    /// Claim up to `limit` due jobs of one type.
    async fn claim_due(&self, job_type: JobType, limit: usize) -> Result<Vec<Job>>;

    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Record a failed attempt, scheduling a retry while attempts remain.
    async fn fail(&self, job_id: &str, error: &str) -> Result<JobFailure>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    async fn has_live_job(&self, job_id: &str) -> Result<bool> {
        Ok(self
            .get_job(job_id)
            .await?
            .map(|job| job.state.is_live())
            .unwrap_or(false))
    }
}

/// Exponential backoff for the given attempt (1-based) with up to 50% jitter.
pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp);
    let jitter_cap = (delay.as_millis() / 2) as u64;
    let jitter = if jitter_cap > 0 {
        rand::thread_rng().gen_range(0..=jitter_cap)
    } else {
        0
    };
    delay + Duration::from_millis(jitter)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// In-process job queue.
pub struct MemoryJobQueue {
    jobs: DashMap<String, Job>,
    backoff_base: Duration,
}

impl MemoryJobQueue {
    pub fn new(backoff_base: Duration) -> Self {
        Self {
            jobs: DashMap::new(),
            backoff_base,
        }
    }

    /// Number of jobs waiting or running.
    pub fn live_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.state.is_live()).count()
    }

    /// Make every waiting job due now.
    pub fn advance_all(&self) {
        let now = now_ms();
        for mut job in self.jobs.iter_mut() {
            if job.state == JobState::Waiting {
                job.run_at = job.run_at.min(now);
            }
        }
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<String> {
        let job = Job::new(job_type, payload, &opts);
        let id = job.id.clone();

        match self.jobs.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().state.is_live() {
                    debug!("Job {} already queued", id);
                } else {
                    entry.insert(job);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(job);
            }
        }
        Ok(id)
    }

    async fn reschedule_delayed(&self, job_id: &str, delay: Duration) -> Result<()> {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.state = JobState::Waiting;
            job.run_at = now_ms() + delay.as_millis() as i64;
        }
        Ok(())
    }

    async fn claim_due(&self, job_type: JobType, limit: usize) -> Result<Vec<Job>> {
        let now = now_ms();
        let mut due: Vec<(i32, i64, String)> = self
            .jobs
            .iter()
            .filter(|j| j.job_type == job_type && j.state == JobState::Waiting && j.run_at <= now)
            .map(|j| (j.priority, j.run_at, j.id.clone()))
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, _, id) in due.into_iter() {
            if claimed.len() >= limit {
                break;
            }
            if let Some(mut job) = self.jobs.get_mut(&id) {
                // Another claimer may have won between the scan and here.
                if job.state == JobState::Waiting && job.run_at <= now {
                    job.state = JobState::Active;
                    claimed.push(job.clone());
                }
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        self.jobs.remove(job_id);
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<JobFailure> {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return Ok(JobFailure::Exhausted { attempts: 0 });
        };

        job.attempts_made += 1;
        job.last_error = Some(error.to_string());

        if job.attempts_made >= job.max_attempts {
            job.state = JobState::Failed;
            warn!("Job {} failed after {} attempts: {}", job_id, job.attempts_made, error);
            return Ok(JobFailure::Exhausted {
                attempts: job.attempts_made,
            });
        }

        let delay = retry_delay(self.backoff_base, job.attempts_made);
        job.state = JobState::Waiting;
        job.run_at = now_ms() + delay.as_millis() as i64;
        Ok(JobFailure::Retrying {
            attempt: job.attempts_made,
            delay,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(job_id).map(|j| j.clone()))
    }
}
