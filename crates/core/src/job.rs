use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::types::{ExternalUserId, OrganizationId, UserId};

/// Fan-out job name: resolves users and enqueues one provisioning job each.
pub const START_DEFAULT_POLICIES: &str = "start_create_default_user_notification_policies";
/// Per-user job name: creates whichever default chain is missing.
pub const CREATE_DEFAULT_POLICIES: &str = "create_default_user_notification_policies";

/// Work items understood by the workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    StartDefaultPolicies(StartDefaultPoliciesArgs),
    CreateDefaultPolicies(CreateDefaultPoliciesArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDefaultPoliciesArgs {
    pub organization_id: OrganizationId,
    pub external_user_ids: Vec<ExternalUserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDefaultPoliciesArgs {
    pub user_id: UserId,
}

impl Job {
    pub fn start_default_policies(
        organization_id: OrganizationId,
        external_user_ids: Vec<ExternalUserId>,
    ) -> Self {
        Self::StartDefaultPolicies(StartDefaultPoliciesArgs {
            organization_id,
            external_user_ids,
        })
    }

    pub fn create_default_policies(user_id: UserId) -> Self {
        Self::CreateDefaultPolicies(CreateDefaultPoliciesArgs { user_id })
    }

    /// Stable name persisted alongside the arguments.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StartDefaultPolicies(_) => START_DEFAULT_POLICIES,
            Self::CreateDefaultPolicies(_) => CREATE_DEFAULT_POLICIES,
        }
    }

    /// Serializes the job arguments for storage.
    pub fn args_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::StartDefaultPolicies(args) => serde_json::to_string(args),
            Self::CreateDefaultPolicies(args) => serde_json::to_string(args),
        }
    }

    /// Restores a job from its persisted name and arguments.
    pub fn decode(name: &str, args_json: &str) -> Result<Self, JobDecodeError> {
        match name {
            START_DEFAULT_POLICIES => Ok(Self::StartDefaultPolicies(serde_json::from_str(
                args_json,
            )?)),
            CREATE_DEFAULT_POLICIES => Ok(Self::CreateDefaultPolicies(serde_json::from_str(
                args_json,
            )?)),
            other => Err(JobDecodeError::UnknownJob(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum JobDecodeError {
    #[error("unknown job name: {0}")]
    UnknownJob(String),
    #[error("failed to decode job arguments: {0}")]
    Args(#[from] serde_json::Error),
}

/// Submission options passed with every enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub queue: String,
    pub retry: RetryPolicy,
    /// Delay before the first attempt becomes eligible.
    pub countdown: Duration,
}

impl EnqueueOptions {
    pub fn new(queue: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            queue: queue.into(),
            retry,
            countdown: Duration::ZERO,
        }
    }

    pub fn with_countdown(mut self, countdown: Duration) -> Self {
        self.countdown = countdown;
        self
    }
}

/// Lifecycle of a persisted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    /// Retries exhausted or failure not retryable; needs an operator.
    Dead,
}

impl JobStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Dead => "DEAD",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "SUCCEEDED" => Some(Self::Succeeded),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }
}
