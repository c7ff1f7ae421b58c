//! Domain types shared by the storage layer and the job workers.

pub mod chain;
pub mod job;
pub mod retry;
pub mod types;

pub use chain::default_chain;
pub use job::{EnqueueOptions, Job, JobDecodeError, JobStatus};
pub use retry::{Backoff, ErrorClass, GiveUpReason, RetryDecision, RetryPolicy};
pub use types::{
    ChainKind, ExternalUserId, JobId, NotificationChannel, NotificationPolicy, Organization,
    OrganizationId, PolicyStep, User, UserId,
};
