use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use oncall_core::{ChainKind, NotificationChannel, NotificationPolicy, PolicyStep, UserId};

use crate::{is_foreign_key_violation, is_transient, is_unique_violation, to_rfc3339};

/// Repository for users' notification-policy chains.
#[derive(Clone)]
pub struct NotificationPolicyRepository {
    pool: SqlitePool,
}

impl NotificationPolicyRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Counts the steps currently in the user's chain of the given kind.
    pub async fn count_for_chain(&self, user_id: UserId, kind: ChainKind) -> Result<u64, PolicyError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM notification_policies WHERE user_id = ? AND important = ?",
        )
        .bind(user_id.get())
        .bind(kind.is_important())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    /// Lists the chain's steps in escalation order.
    pub async fn list_chain(
        &self,
        user_id: UserId,
        kind: ChainKind,
    ) -> Result<Vec<NotificationPolicy>, PolicyError> {
        let rows = sqlx::query_as::<_, PolicyRow>(
            "SELECT id, user_id, important, position, step, notify_by, wait_delay_secs \
               FROM notification_policies \
              WHERE user_id = ? AND important = ? \
              ORDER BY position ASC",
        )
        .bind(user_id.get())
        .bind(kind.is_important())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PolicyRow::into_domain).collect()
    }

    /// Creates the chain from `steps` in a single transaction.
    ///
    /// The unique `(user_id, important, position)` index makes this a
    /// create-if-absent: when another writer already owns any of the
    /// positions, nothing is written and [`ChainOutcome::AlreadyExists`] is returned.
    pub async fn create_default_chain(
        &self,
        user_id: UserId,
        kind: ChainKind,
        steps: &[PolicyStep],
        created_at: DateTime<Utc>,
    ) -> Result<ChainOutcome, PolicyError> {
        if steps.is_empty() {
            return Err(PolicyError::EmptyChain);
        }

        let created_at = to_rfc3339(created_at);
        let mut tx = self.pool.begin().await?;

        for (position, step) in steps.iter().enumerate() {
            let (notify_by, wait_delay_secs) = match step {
                PolicyStep::Notify { channel } => (Some(channel.as_str()), None),
                PolicyStep::Wait { delay } => (None, Some(delay.as_secs() as i64)),
            };

            let result = sqlx::query(
                "INSERT INTO notification_policies \
                 (user_id, important, position, step, notify_by, wait_delay_secs, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(user_id.get())
            .bind(kind.is_important())
            .bind(position as i64)
            .bind(step.kind_str())
            .bind(notify_by)
            .bind(wait_delay_secs)
            .bind(&created_at)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(_) => {}
                Err(err) if is_unique_violation(&err) => {
                    tx.rollback().await?;
                    return Ok(ChainOutcome::AlreadyExists);
                }
                Err(err) if is_foreign_key_violation(&err) => {
                    tx.rollback().await?;
                    return Err(PolicyError::MissingUser);
                }
                Err(err) => return Err(PolicyError::Database(err)),
            }
        }

        tx.commit().await?;
        Ok(ChainOutcome::Created { steps: steps.len() })
    }
}

/// Result of attempting to create a default chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Created { steps: usize },
    AlreadyExists,
}

impl ChainOutcome {
    pub fn is_created(self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PolicyRow {
    id: i64,
    user_id: i64,
    important: bool,
    position: i64,
    step: String,
    notify_by: Option<String>,
    wait_delay_secs: Option<i64>,
}

impl PolicyRow {
    fn into_domain(self) -> Result<NotificationPolicy, PolicyError> {
        let step = match (self.step.as_str(), self.notify_by, self.wait_delay_secs) {
            ("notify", Some(channel), None) => PolicyStep::Notify {
                channel: channel
                    .parse::<NotificationChannel>()
                    .map_err(|value| PolicyError::InvalidRow(format!("unknown channel {value}")))?,
            },
            ("wait", None, Some(secs)) if secs >= 0 => PolicyStep::Wait {
                delay: Duration::from_secs(secs as u64),
            },
            (step, _, _) => {
                return Err(PolicyError::InvalidRow(format!(
                    "policy {} has an inconsistent {step} step",
                    self.id
                )))
            }
        };

        Ok(NotificationPolicy {
            id: self.id,
            user_id: UserId(self.user_id),
            important: self.important,
            position: self.position as u32,
            step,
        })
    }
}

/// Errors that can occur while reading or creating chains.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("user is missing for notification policy")]
    MissingUser,
    #[error("a chain needs at least one step")]
    EmptyChain,
    #[error("invalid notification policy row: {0}")]
    InvalidRow(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PolicyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(err) if is_transient(err))
    }
}
