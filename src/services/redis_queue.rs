//! Redis-backed job queue shared by every worker process.
//!
//! Each job is a JSON document under `reckon:job:{id}`; every live job sits in
//! a per-type sorted set scored by due time. Claiming moves a job's score to
//! the end of its lease instead of removing it, so a job whose worker dies is
//! claimed again once the lease runs out. Document and score always change in
//! one MULTI.

use crate::error::{EngineError, Result};
use crate::services::queue::{now_ms, retry_delay, JobQueue};
use crate::types::{Job, JobFailure, JobOptions, JobState, JobType};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Redis key prefixes
const JOB_PREFIX: &str = "reckon:job:";
const DUE_PREFIX: &str = "reckon:due:";

/// Completed and failed jobs expire after a day.
const FINISHED_TTL_SECS: u64 = 24 * 60 * 60;

/// Take up to ARGV[2] ids due by ARGV[1] and push them to ARGV[3].
const CLAIM_SCRIPT: &str = r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(ids) do
  redis.call('ZADD', KEYS[1], ARGV[3], id)
end
return ids
";

#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    claim: Script,
    backoff_base: Duration,
    lease: Duration,
}

impl RedisJobQueue {
    /// Connect to Redis at the given URL. A claimed job that is not finished
    /// within `lease` becomes due again.
    pub async fn connect(redis_url: &str, backoff_base: Duration, lease: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis job queue at {}", redis_url);
        Ok(Self {
            conn,
            claim: Script::new(CLAIM_SCRIPT),
            backoff_base,
            lease,
        })
    }

    fn job_key(job_id: &str) -> String {
        format!("{}{}", JOB_PREFIX, job_id)
    }

    fn due_key(job_type: JobType) -> String {
        format!("{}{}", DUE_PREFIX, job_type.as_str())
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::job_key(job_id))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| EngineError::Queue(format!("corrupt job {}: {}", job_id, e))),
            None => Ok(None),
        }
    }

    /// Write the document and its due entry together. Live jobs are due at
    /// `run_at`; finished jobs leave the due set and expire.
    async fn save(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job)?;
        let job_key = Self::job_key(&job.id);
        let due_key = Self::due_key(job.job_type);

        let mut pipe = redis::pipe();
        pipe.atomic();
        if job.state.is_live() {
            pipe.cmd("SET").arg(&job_key).arg(json).ignore();
            pipe.cmd("ZADD")
                .arg(&due_key)
                .arg(job.run_at)
                .arg(&job.id)
                .ignore();
        } else {
            pipe.cmd("SET")
                .arg(&job_key)
                .arg(json)
                .arg("EX")
                .arg(FINISHED_TTL_SECS)
                .ignore();
            pipe.cmd("ZREM").arg(&due_key).arg(&job.id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn forget(&self, job_type: JobType, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(Self::job_key(job_id))
            .ignore()
            .cmd("ZREM")
            .arg(Self::due_key(job_type))
            .arg(job_id)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<String> {
        let job = Job::new(job_type, payload, &opts);

        if let Some(existing) = self.load(&job.id).await? {
            if existing.state.is_live() {
                debug!("Job {} already queued", job.id);
                return Ok(existing.id);
            }
        }

        self.save(&job).await?;
        Ok(job.id)
    }

    async fn reschedule_delayed(&self, job_id: &str, delay: Duration) -> Result<()> {
        let Some(mut job) = self.load(job_id).await? else {
            return Ok(());
        };
        job.state = JobState::Waiting;
        job.run_at = now_ms() + delay.as_millis() as i64;
        self.save(&job).await
    }

    async fn claim_due(&self, job_type: JobType, limit: usize) -> Result<Vec<Job>> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let lease_until = now + self.lease.as_millis() as i64;
        let ids: Vec<String> = self
            .claim
            .key(Self::due_key(job_type))
            .arg(now)
            .arg(limit)
            .arg(lease_until)
            .invoke_async(&mut conn)
            .await?;

        let mut claimed = Vec::new();
        for id in ids {
            match self.load(&id).await? {
                Some(mut job) => {
                    if job.state == JobState::Active {
                        warn!("Job {} outlived its lease, claiming again", id);
                    }
                    job.state = JobState::Active;
                    job.run_at = lease_until;
                    self.save(&job).await?;
                    claimed.push(job);
                }
                None => {
                    warn!("Due entry {} has no job document", id);
                    self.forget(job_type, &id).await?;
                }
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        match self.load(job_id).await? {
            Some(job) => self.forget(job.job_type, job_id).await,
            None => Ok(()),
        }
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<JobFailure> {
        let Some(mut job) = self.load(job_id).await? else {
            return Ok(JobFailure::Exhausted { attempts: 0 });
        };

        job.attempts_made += 1;
        job.last_error = Some(error.to_string());

        if job.attempts_made >= job.max_attempts {
            job.state = JobState::Failed;
            self.save(&job).await?;
            warn!("Job {} failed after {} attempts: {}", job_id, job.attempts_made, error);
            return Ok(JobFailure::Exhausted {
                attempts: job.attempts_made,
            });
        }

        let delay = retry_delay(self.backoff_base, job.attempts_made);
        job.state = JobState::Waiting;
        job.run_at = now_ms() + delay.as_millis() as i64;
        self.save(&job).await?;
        Ok(JobFailure::Retrying {
            attempt: job.attempts_made,
            delay,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.load(job_id).await
    }
}
