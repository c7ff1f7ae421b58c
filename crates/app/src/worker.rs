use std::time::{Duration, Instant};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use rand::Rng;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, sleep, timeout, MissedTickBehavior},
};
use tracing::{error, info, warn};

use oncall_core::{GiveUpReason, Job, JobId, RetryDecision};
use oncall_storage::{Database, JobError, JobRecord, JobRepository};
use oncall_util::WorkerConfig;

use crate::queue::Clock;
use crate::tasks::{JobOutput, ProvisioningTasks, TaskError};

/// Pool of job runners plus a sweeper that recovers abandoned leases.
#[derive(Clone)]
pub struct WorkerPool {
    jobs: JobRepository,
    tasks: ProvisioningTasks,
    queue: String,
    concurrency: usize,
    poll_interval: Duration,
    job_timeout: Duration,
    clock: Clock,
}

impl WorkerPool {
    pub fn new(
        database: &Database,
        tasks: ProvisioningTasks,
        config: &WorkerConfig,
        clock: Clock,
    ) -> Self {
        Self {
            jobs: database.jobs(),
            queue: tasks.settings().queue.clone(),
            tasks,
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval,
            job_timeout: config.job_timeout,
            clock,
        }
    }

    /// Starts the runners and the sweeper. All of them stop once `shutdown` flips to `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.concurrency + 1);
        for worker in 0..self.concurrency {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.run_loop(worker, shutdown).await;
            }));
        }

        handles.push(tokio::spawn(async move {
            self.sweep_loop(shutdown).await;
        }));
        handles
    }

    async fn run_loop(self, worker: usize, mut shutdown: watch::Receiver<bool>) {
        info!(stage = "worker", worker, queue = %self.queue, "worker started");
        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    error!(stage = "worker", worker, error = %err, "job bookkeeping failed")
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = sleep(self.poll_interval) => {}
            }
        }
        info!(stage = "worker", worker, "worker stopped");
    }

    async fn sweep_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.job_timeout.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_once().await {
                        error!(stage = "worker", error = %err, "stale lease sweep failed");
                    }
                }
            }
        }
    }

    /// Returns leases older than twice the job timeout to the queue.
    pub async fn sweep_once(&self) -> Result<u64, WorkerError> {
        let now = self.now();
        let locked_before = self
            .job_timeout
            .checked_mul(2)
            .and_then(|lease| ChronoDuration::from_std(lease).ok())
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or_else(|| now - ChronoDuration::days(1));
        let requeued = self.jobs.requeue_stale(locked_before, now).await?;
        if requeued > 0 {
            warn!(stage = "worker", requeued, "requeued jobs with stale leases");
        }
        Ok(requeued)
    }

    /// Claims and runs at most one due job. Returns `None` when the queue is idle.
    pub async fn run_once(&self) -> Result<Option<JobReport>, WorkerError> {
        let Some(record) = self.jobs.claim_next(&self.queue, self.now()).await? else {
            return Ok(None);
        };
        self.process(record).await.map(Some)
    }

    /// Runs a leased job under the job timeout and records the outcome.
    async fn process(&self, record: JobRecord) -> Result<JobReport, WorkerError> {
        let started = Instant::now();
        let result = match Job::decode(&record.name, &record.args_json) {
            Ok(job) => match timeout(self.job_timeout, self.tasks.run(&job)).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::Timeout(self.job_timeout)),
            },
            Err(err) => Err(TaskError::Decode(err)),
        };
        histogram!("job_duration_seconds", "job" => record.name.clone())
            .record(started.elapsed().as_secs_f64());

        let disposition = match result {
            Ok(output) => self.complete(&record, &output).await?,
            Err(err) => self.fail(&record, err).await?,
        };

        Ok(JobReport {
            id: record.id,
            name: record.name,
            attempts: record.attempts,
            disposition,
        })
    }

    async fn complete(
        &self,
        record: &JobRecord,
        output: &JobOutput,
    ) -> Result<JobDisposition, WorkerError> {
        if !self.jobs.mark_succeeded(record.id, self.now()).await? {
            warn!(
                stage = "worker",
                job_id = %record.id,
                job = %record.name,
                "lease lost before completion"
            );
        }
        counter!("jobs_completed_total", "job" => record.name.clone()).increment(1);
        info!(
            stage = "worker",
            job_id = %record.id,
            job = %record.name,
            attempts = record.attempts,
            output = ?output,
            "job succeeded"
        );
        Ok(JobDisposition::Succeeded)
    }

    async fn fail(
        &self,
        record: &JobRecord,
        err: TaskError,
    ) -> Result<JobDisposition, WorkerError> {
        let class = err.class();
        let message = err.to_string();
        let now = self.now();

        match record.retry.decide(record.retries_so_far(), class) {
            RetryDecision::Retry { retry } => {
                let sample = rand::thread_rng().gen::<f64>();
                let delay = record.retry.backoff.delay(retry, sample);
                let run_at = now
                    + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                self.jobs
                    .schedule_retry(record.id, run_at, &message, now)
                    .await?;
                counter!(
                    "jobs_retried_total",
                    "job" => record.name.clone(),
                    "class" => class.as_str()
                )
                .increment(1);
                warn!(
                    stage = "worker",
                    job_id = %record.id,
                    job = %record.name,
                    class = class.as_str(),
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "job failed, retry scheduled"
                );
                Ok(JobDisposition::Retrying { retry, run_at })
            }
            RetryDecision::GiveUp(reason) => {
                self.jobs.mark_dead(record.id, &message, now).await?;
                counter!(
                    "jobs_dead_total",
                    "job" => record.name.clone(),
                    "class" => class.as_str()
                )
                .increment(1);
                error!(
                    stage = "worker",
                    job_id = %record.id,
                    job = %record.name,
                    class = class.as_str(),
                    reason = reason.as_str(),
                    attempts = record.attempts,
                    error = %message,
                    "job failed permanently"
                );
                Ok(JobDisposition::Dead { reason })
            }
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

/// Summary of one processed job attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub id: JobId,
    pub name: String,
    pub attempts: u32,
    pub disposition: JobDisposition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Succeeded,
    Retrying { retry: u32, run_at: DateTime<Utc> },
    Dead { reason: GiveUpReason },
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job bookkeeping failed: {0}")]
    Jobs(#[from] JobError),
}
