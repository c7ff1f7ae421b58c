use std::{sync::Arc, time::Duration};

use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use oncall_core::{
    default_chain, Backoff, ChainKind, EnqueueOptions, ErrorClass, ExternalUserId, Job,
    JobDecodeError, JobId, OrganizationId, RetryPolicy, UserId,
};
use oncall_storage::{ChainOutcome, Database, PolicyError, UserError};
use oncall_util::WorkerConfig;

use crate::queue::{Clock, JobQueue, QueueError};

const DISPATCH_MAX_RETRIES: u32 = 3;

/// Queue and retry settings for the provisioning jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSettings {
    pub queue: String,
    pub dispatch_retry: RetryPolicy,
    pub provision_retry: RetryPolicy,
}

impl ProvisionSettings {
    pub fn from_config(config: &WorkerConfig) -> Result<Self, SettingsError> {
        let retry_on = config
            .provision_retry_on
            .iter()
            .map(|name| {
                name.parse::<ErrorClass>()
                    .map_err(|_| SettingsError::UnknownErrorClass(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            queue: config.queue.clone(),
            dispatch_retry: RetryPolicy::on_any_error(DISPATCH_MAX_RETRIES, Backoff::exponential())
                .with_retry_on([ErrorClass::Transient]),
            provision_retry: RetryPolicy::on_any_error(
                config.provision_max_retries,
                Backoff::exponential(),
            )
            .with_retry_on(retry_on),
        })
    }

    pub fn dispatch_options(&self) -> EnqueueOptions {
        EnqueueOptions::new(self.queue.clone(), self.dispatch_retry.clone())
    }

    pub fn provision_options(&self) -> EnqueueOptions {
        EnqueueOptions::new(self.queue.clone(), self.provision_retry.clone())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("PROVISION_RETRY_ON names an unknown error class: {0:?}")]
    UnknownErrorClass(String),
}

/// Jobs submitted for one dispatch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched: usize,
    pub enqueued: Vec<JobId>,
}

/// What happened to one of the user's chains during provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainProvision {
    /// The user already had steps in this chain.
    Existing,
    Created { steps: usize },
    /// Another run created the chain between our check and our insert.
    Raced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub default: ChainProvision,
    pub important: ChainProvision,
}

impl ProvisionOutcome {
    pub fn is_noop(&self) -> bool {
        !matches!(self.default, ChainProvision::Created { .. })
            && !matches!(self.important, ChainProvision::Created { .. })
    }
}

/// Result of running one job to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Dispatched(DispatchReport),
    Provisioned(ProvisionOutcome),
}

/// Handlers for the provisioning jobs.
#[derive(Clone)]
pub struct ProvisioningTasks {
    database: Database,
    queue: JobQueue,
    settings: Arc<ProvisionSettings>,
    clock: Clock,
}

impl ProvisioningTasks {
    pub fn new(
        database: Database,
        queue: JobQueue,
        settings: ProvisionSettings,
        clock: Clock,
    ) -> Self {
        Self {
            database,
            queue,
            settings: Arc::new(settings),
            clock,
        }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Submits the fan-out job for the given organization members.
    pub async fn submit_default_policies(
        &self,
        organization_id: OrganizationId,
        external_user_ids: Vec<ExternalUserId>,
    ) -> Result<JobId, QueueError> {
        self.queue
            .enqueue(
                &Job::start_default_policies(organization_id, external_user_ids),
                &self.settings.dispatch_options(),
            )
            .await
    }

    pub async fn run(&self, job: &Job) -> Result<JobOutput, TaskError> {
        match job {
            Job::StartDefaultPolicies(args) => self
                .dispatch_default_policies(args.organization_id, &args.external_user_ids)
                .await
                .map(JobOutput::Dispatched),
            Job::CreateDefaultPolicies(args) => self
                .provision_user(args.user_id)
                .await
                .map(JobOutput::Provisioned),
        }
    }

    /// Enqueues one provisioning job per member of `organization_id` whose
    /// external id is listed. Unknown ids are skipped.
    ///
    /// Jobs enqueued before a failure stay queued.
    pub async fn dispatch_default_policies(
        &self,
        organization_id: OrganizationId,
        external_user_ids: &[ExternalUserId],
    ) -> Result<DispatchReport, TaskError> {
        let users = if external_user_ids.is_empty() {
            Vec::new()
        } else {
            self.database
                .users()
                .list_by_external_ids(organization_id, external_user_ids)
                .await?
        };

        let options = self.settings.provision_options();
        let mut enqueued = Vec::with_capacity(users.len());
        for user in &users {
            let id = self
                .queue
                .enqueue(&Job::create_default_policies(user.id), &options)
                .await?;
            counter!("provision_users_dispatched_total").increment(1);
            enqueued.push(id);
        }

        info!(
            stage = "dispatch",
            organization_id = %organization_id,
            requested = external_user_ids.len(),
            matched = users.len(),
            "default policy provisioning dispatched"
        );

        Ok(DispatchReport {
            matched: users.len(),
            enqueued,
        })
    }

    /// Creates whichever of the user's default and important chains is empty.
    pub async fn provision_user(&self, user_id: UserId) -> Result<ProvisionOutcome, TaskError> {
        let user = self.database.users().fetch(user_id).await.map_err(|err| match err {
            UserError::NotFound => TaskError::UserNotFound(user_id),
            other => TaskError::Users(other),
        })?;

        let default = self.provision_chain(user.id, ChainKind::Default).await?;
        let important = self.provision_chain(user.id, ChainKind::Important).await?;
        let outcome = ProvisionOutcome { default, important };

        info!(
            stage = "provision",
            user_id = %user.id,
            default = ?outcome.default,
            important = ?outcome.important,
            noop = outcome.is_noop(),
            "default notification policies provisioned"
        );
        Ok(outcome)
    }

    async fn provision_chain(
        &self,
        user_id: UserId,
        kind: ChainKind,
    ) -> Result<ChainProvision, TaskError> {
        let policies = self.database.notification_policies();
        if policies.count_for_chain(user_id, kind).await? > 0 {
            return Ok(ChainProvision::Existing);
        }

        let outcome = policies
            .create_default_chain(user_id, kind, &default_chain(kind), (self.clock)())
            .await
            .map_err(|err| match err {
                PolicyError::MissingUser => TaskError::UserNotFound(user_id),
                other => TaskError::Policies(other),
            })?;

        Ok(match outcome {
            ChainOutcome::Created { steps } => {
                counter!("notification_chains_created_total", "chain" => kind.as_str())
                    .increment(1);
                ChainProvision::Created { steps }
            }
            ChainOutcome::AlreadyExists => {
                warn!(
                    stage = "provision",
                    user_id = %user_id,
                    chain = kind.as_str(),
                    "chain created concurrently, leaving it untouched"
                );
                ChainProvision::Raced
            }
        })
    }
}

/// Failure of a single job attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error(transparent)]
    Users(#[from] UserError),
    #[error(transparent)]
    Policies(#[from] PolicyError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("undecodable job: {0}")]
    Decode(#[from] JobDecodeError),
    #[error("job exceeded its {0:?} timeout")]
    Timeout(Duration),
}

impl TaskError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::UserNotFound(_) | Self::Users(UserError::NotFound) => ErrorClass::NotFound,
            Self::Timeout(_) => ErrorClass::Transient,
            Self::Users(err) if err.is_transient() => ErrorClass::Transient,
            Self::Policies(err) if err.is_transient() => ErrorClass::Transient,
            Self::Queue(err) if err.is_transient() => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        insert_org, insert_user, settings, setup_db, setup_file_db, tasks_for,
    };
    use oncall_core::{JobStatus, NotificationChannel, PolicyStep};
    use oncall_storage::JobRecord;

    fn ids(values: &[i64]) -> Vec<ExternalUserId> {
        values.iter().copied().map(ExternalUserId).collect()
    }

    async fn provisioning_jobs(db: &Database) -> Vec<JobRecord> {
        db.jobs()
            .list_by_name(oncall_core::job::CREATE_DEFAULT_POLICIES)
            .await
            .expect("list jobs")
    }

    async fn chain_len(db: &Database, user_id: UserId, kind: ChainKind) -> u64 {
        db.notification_policies()
            .count_for_chain(user_id, kind)
            .await
            .expect("count chain")
    }

    #[tokio::test]
    async fn dispatch_enqueues_one_job_per_matched_member() {
        let db = setup_db().await;
        let tasks = tasks_for(&db);
        let org = insert_org(&db, "org-1").await;
        let other = insert_org(&db, "org-2").await;
        let alice = insert_user(&db, &org, 10).await;
        let bob = insert_user(&db, &org, 11).await;
        insert_user(&db, &org, 12).await;
        insert_user(&db, &other, 13).await;

        let report = tasks
            .dispatch_default_policies(org.id, &ids(&[10, 11, 11, 13, 404]))
            .await
            .expect("dispatch");

        assert_eq!(report.matched, 2);
        assert_eq!(report.enqueued.len(), 2);

        let jobs = provisioning_jobs(&db).await;
        let targets: Vec<Job> = jobs
            .iter()
            .map(|job| Job::decode(&job.name, &job.args_json).expect("decode"))
            .collect();
        assert_eq!(
            targets,
            vec![
                Job::create_default_policies(alice.id),
                Job::create_default_policies(bob.id),
            ]
        );
        assert!(jobs.iter().all(|job| job.status == JobStatus::Queued));
        assert!(jobs.iter().all(|job| job.retry == tasks.settings().provision_retry));
        assert_eq!(chain_len(&db, alice.id, ChainKind::Default).await, 0);
    }

    #[tokio::test]
    async fn dispatch_with_no_ids_enqueues_nothing() {
        let db = setup_db().await;
        let tasks = tasks_for(&db);
        let org = insert_org(&db, "org-1").await;
        insert_user(&db, &org, 10).await;

        let report = tasks
            .dispatch_default_policies(org.id, &[])
            .await
            .expect("dispatch");

        assert_eq!(report.matched, 0);
        assert!(report.enqueued.is_empty());
        assert!(provisioning_jobs(&db).await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_for_unknown_organization_matches_nobody() {
        let db = setup_db().await;
        let tasks = tasks_for(&db);
        let org = insert_org(&db, "org-1").await;
        insert_user(&db, &org, 10).await;

        let report = tasks
            .dispatch_default_policies(OrganizationId(999), &ids(&[10]))
            .await
            .expect("dispatch");

        assert_eq!(report.matched, 0);
        assert!(provisioning_jobs(&db).await.is_empty());
    }

    #[tokio::test]
    async fn provisioning_a_fresh_user_creates_both_chains() {
        let db = setup_db().await;
        let tasks = tasks_for(&db);
        let org = insert_org(&db, "org-1").await;
        let user = insert_user(&db, &org, 10).await;

        let outcome = tasks.provision_user(user.id).await.expect("provision");

        assert_eq!(
            outcome,
            ProvisionOutcome {
                default: ChainProvision::Created { steps: 3 },
                important: ChainProvision::Created { steps: 3 },
            }
        );
        for kind in ChainKind::ALL {
            let chain = db
                .notification_policies()
                .list_chain(user.id, kind)
                .await
                .expect("list chain");
            let steps: Vec<PolicyStep> = chain.iter().map(|policy| policy.step).collect();
            assert_eq!(steps, default_chain(kind));
        }
    }

    #[tokio::test]
    async fn provisioning_a_fully_provisioned_user_is_a_noop() {
        let db = setup_db().await;
        let tasks = tasks_for(&db);
        let org = insert_org(&db, "org-1").await;
        let user = insert_user(&db, &org, 10).await;
        tasks.provision_user(user.id).await.expect("first run");

        let outcome = tasks.provision_user(user.id).await.expect("second run");

        assert!(outcome.is_noop());
        assert_eq!(outcome.default, ChainProvision::Existing);
        assert_eq!(outcome.important, ChainProvision::Existing);
        assert_eq!(chain_len(&db, user.id, ChainKind::Default).await, 3);
        assert_eq!(chain_len(&db, user.id, ChainKind::Important).await, 3);
    }

    #[tokio::test]
    async fn provisioning_fills_only_the_missing_chain() {
        let db = setup_db().await;
        let tasks = tasks_for(&db);
        let org = insert_org(&db, "org-1").await;
        let user = insert_user(&db, &org, 10).await;
        let custom = [PolicyStep::notify(NotificationChannel::Email)];
        db.notification_policies()
            .create_default_chain(user.id, ChainKind::Important, &custom, chrono::Utc::now())
            .await
            .expect("seed important chain");

        let outcome = tasks.provision_user(user.id).await.expect("provision");

        assert_eq!(outcome.default, ChainProvision::Created { steps: 3 });
        assert_eq!(outcome.important, ChainProvision::Existing);
        let important = db
            .notification_policies()
            .list_chain(user.id, ChainKind::Important)
            .await
            .expect("list important");
        assert_eq!(important.len(), 1);
        assert_eq!(important[0].step, custom[0]);
    }

    #[tokio::test]
    async fn concurrent_provisioning_never_duplicates_chains() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = setup_file_db(&dir).await;
        let tasks = tasks_for(&db);
        let org = insert_org(&db, "org-1").await;
        let user = insert_user(&db, &org, 10).await;
        let user_id = user.id;

        let mut handles = Vec::new();
        for _ in 0..4 {
            let tasks = tasks.clone();
            handles.push(tokio::spawn(async move { tasks.provision_user(user_id).await }));
        }

        let mut created = 0;
        for handle in handles {
            let outcome = handle.await.expect("join").expect("provision");
            for chain in [outcome.default, outcome.important] {
                if matches!(chain, ChainProvision::Created { .. }) {
                    created += 1;
                }
            }
        }

        assert_eq!(created, 2);
        assert_eq!(chain_len(&db, user_id, ChainKind::Default).await, 3);
        assert_eq!(chain_len(&db, user_id, ChainKind::Important).await, 3);
    }

    #[tokio::test]
    async fn provisioning_an_unknown_user_fails_with_not_found() {
        let db = setup_db().await;
        let tasks = tasks_for(&db);

        let err = tasks.provision_user(UserId(404)).await.unwrap_err();

        assert!(matches!(err, TaskError::UserNotFound(UserId(404))));
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn run_routes_jobs_to_their_handlers() {
        let db = setup_db().await;
        let tasks = tasks_for(&db);
        let org = insert_org(&db, "org-1").await;
        let user = insert_user(&db, &org, 10).await;

        let dispatched = tasks
            .run(&Job::start_default_policies(org.id, ids(&[10])))
            .await
            .expect("dispatch job");
        assert!(matches!(dispatched, JobOutput::Dispatched(report) if report.matched == 1));

        let provisioned = tasks
            .run(&Job::create_default_policies(user.id))
            .await
            .expect("provision job");
        assert!(matches!(provisioned, JobOutput::Provisioned(outcome) if !outcome.is_noop()));
    }

    #[test]
    fn settings_follow_worker_config() {
        let settings = settings();
        assert_eq!(settings.queue, "notification_policies");
        assert_eq!(settings.provision_retry.max_retries, 3);
        assert_eq!(settings.provision_retry.backoff, Backoff::exponential());
        assert!(ErrorClass::ALL
            .iter()
            .all(|class| settings.provision_retry.retries(*class)));
        assert!(settings.dispatch_retry.retries(ErrorClass::Transient));
        assert!(!settings.dispatch_retry.retries(ErrorClass::NotFound));
        assert!(!settings.dispatch_retry.retries(ErrorClass::Permanent));
    }

    #[test]
    fn settings_accept_a_narrower_retry_set() {
        let config = WorkerConfig {
            provision_retry_on: vec!["transient".to_string()],
            provision_max_retries: 5,
            ..WorkerConfig::default()
        };
        let settings = ProvisionSettings::from_config(&config).expect("settings");

        assert_eq!(settings.provision_retry.max_retries, 5);
        assert!(!settings.provision_retry.retries(ErrorClass::NotFound));
        assert!(settings.provision_retry.retries(ErrorClass::Transient));
    }

    #[test]
    fn settings_reject_unknown_error_classes() {
        let config = WorkerConfig {
            provision_retry_on: vec!["flaky".to_string()],
            ..WorkerConfig::default()
        };
        assert_eq!(
            ProvisionSettings::from_config(&config),
            Err(SettingsError::UnknownErrorClass("flaky".to_string()))
        );
    }

    #[test]
    fn errors_map_to_retry_classes() {
        assert_eq!(
            TaskError::Users(UserError::NotFound).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            TaskError::Timeout(Duration::from_secs(1)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            TaskError::Users(UserError::Database(sqlx::Error::PoolTimedOut)).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            TaskError::Policies(PolicyError::EmptyChain).class(),
            ErrorClass::Permanent
        );
        let decode = Job::decode("unknown", "{}").unwrap_err();
        assert_eq!(TaskError::Decode(decode).class(), ErrorClass::Permanent);
    }
}
