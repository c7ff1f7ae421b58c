use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::debug;

use oncall_core::{EnqueueOptions, Job, JobId};
use oncall_storage::{Database, JobError, JobRepository, NewJob};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Producer side of the durable job queue.
#[derive(Clone)]
pub struct JobQueue {
    jobs: JobRepository,
    clock: Clock,
}

impl JobQueue {
    pub fn new(database: &Database, clock: Clock) -> Self {
        Self {
            jobs: database.jobs(),
            clock,
        }
    }

    /// Persists `job` so that a worker on `options.queue` picks it up once
    /// `options.countdown` has elapsed.
    pub async fn enqueue(&self, job: &Job, options: &EnqueueOptions) -> Result<JobId, QueueError> {
        let args_json = job.args_json()?;
        let now = (self.clock)();
        let countdown =
            ChronoDuration::from_std(options.countdown).map_err(|_| QueueError::Countdown)?;

        let id = self
            .jobs
            .enqueue(&NewJob {
                queue: &options.queue,
                name: job.name(),
                args_json: &args_json,
                retry: &options.retry,
                run_at: now + countdown,
                created_at: now,
            })
            .await?;

        counter!("jobs_enqueued_total", "job" => job.name()).increment(1);
        debug!(
            stage = "queue",
            job = job.name(),
            queue = %options.queue,
            job_id = %id,
            "job enqueued"
        );
        Ok(id)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to encode job arguments: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("countdown is out of range")]
    Countdown,
    #[error(transparent)]
    Storage(#[from] JobError),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{fixed_clock, setup_db};
    use oncall_core::{JobStatus, RetryPolicy, UserId};

    #[tokio::test]
    async fn enqueue_persists_a_queued_job_due_after_its_countdown() {
        let db = setup_db().await;
        let (now, clock) = fixed_clock();
        let queue = JobQueue::new(&db, clock);
        let options = EnqueueOptions::new("provisioning", RetryPolicy::none())
            .with_countdown(Duration::from_secs(30));

        let id = queue
            .enqueue(&Job::create_default_policies(UserId(7)), &options)
            .await
            .expect("enqueue");

        let record = db.jobs().fetch(id).await.expect("fetch");
        assert_eq!(record.queue, "provisioning");
        assert_eq!(record.name, oncall_core::job::CREATE_DEFAULT_POLICIES);
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.retry, RetryPolicy::none());
        assert_eq!(record.run_at, now + ChronoDuration::seconds(30));
        assert_eq!(
            Job::decode(&record.name, &record.args_json).expect("decode"),
            Job::create_default_policies(UserId(7))
        );
    }
}
