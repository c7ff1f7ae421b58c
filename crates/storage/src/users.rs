use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use thiserror::Error;

use oncall_core::{ExternalUserId, OrganizationId, User, UserId};

use crate::{is_foreign_key_violation, is_transient, is_unique_violation, to_rfc3339};

const COLUMNS: &str = "id, organization_id, external_id, username, email, created_at";

/// Keeps `IN (...)` lists well below SQLite's bound parameter limit.
const LOOKUP_CHUNK: usize = 500;

/// Repository for users and their identity-provider mapping.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a user for an existing organization.
    pub async fn insert(&self, record: &NewUser<'_>) -> Result<User, UserError> {
        let query = format!(
            "INSERT INTO users (organization_id, external_id, username, email, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, UserRow>(&query)
            .bind(record.organization_id.get())
            .bind(record.external_id.get())
            .bind(record.username)
            .bind(record.email)
            .bind(to_rfc3339(record.created_at))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    UserError::Duplicate
                } else if is_foreign_key_violation(&err) {
                    UserError::MissingOrganization
                } else {
                    UserError::Database(err)
                }
            })?;

        Ok(row.into_domain())
    }

    /// Loads a user by internal id.
    pub async fn fetch(&self, id: UserId) -> Result<User, UserError> {
        let query = format!("SELECT {COLUMNS} FROM users WHERE id = ?");
        let row = sqlx::query_as::<_, UserRow>(&query)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)?;

        Ok(row.into_domain())
    }

    /// Returns the users of `organization_id` whose external id is in `external_ids`,
    /// ordered by internal id. Ids without a matching user are ignored.
    pub async fn list_by_external_ids(
        &self,
        organization_id: OrganizationId,
        external_ids: &[ExternalUserId],
    ) -> Result<Vec<User>, UserError> {
        let unique: Vec<ExternalUserId> = external_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut users = Vec::new();
        for chunk in unique.chunks(LOOKUP_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {COLUMNS} FROM users WHERE organization_id = "
            ));
            builder.push_bind(organization_id.get());
            builder.push(" AND external_id IN (");
            let mut separated = builder.separated(", ");
            for external_id in chunk {
                separated.push_bind(external_id.get());
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<UserRow>()
                .fetch_all(&self.pool)
                .await?;
            users.extend(rows.into_iter().map(UserRow::into_domain));
        }

        users.sort_by_key(|user| user.id);
        Ok(users)
    }
}

/// Data required to create a user.
pub struct NewUser<'a> {
    pub organization_id: OrganizationId,
    pub external_id: ExternalUserId,
    pub username: &'a str,
    pub email: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    organization_id: i64,
    external_id: i64,
    username: String,
    email: Option<String>,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn into_domain(self) -> User {
        User {
            id: UserId(self.id),
            organization_id: OrganizationId(self.organization_id),
            external_id: ExternalUserId(self.external_id),
            username: self.username,
            email: self.email,
            created_at: self.created_at,
        }
    }
}

/// Errors that can occur while reading or writing users.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("user with the same external id already exists in the organization")]
    Duplicate,
    #[error("organization is missing for user")]
    MissingOrganization,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl UserError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(err) if is_transient(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_org, insert_user, setup_db};

    fn ids(values: &[i64]) -> Vec<ExternalUserId> {
        values.iter().copied().map(ExternalUserId).collect()
    }

    #[tokio::test]
    async fn list_by_external_ids_filters_by_organization() {
        let db = setup_db().await;
        let org = insert_org(&db, "org-1").await;
        let other = insert_org(&db, "org-2").await;
        let alice = insert_user(&db, &org, 10).await;
        let bob = insert_user(&db, &org, 11).await;
        insert_user(&db, &org, 12).await;
        insert_user(&db, &other, 10).await;

        let users = db
            .users()
            .list_by_external_ids(org.id, &ids(&[11, 10, 99]))
            .await
            .expect("lookup");

        assert_eq!(users, vec![alice, bob]);
    }

    #[tokio::test]
    async fn list_by_external_ids_collapses_duplicates_and_empty_input() {
        let db = setup_db().await;
        let org = insert_org(&db, "org-1").await;
        insert_user(&db, &org, 10).await;
        let repo = db.users();

        let users = repo
            .list_by_external_ids(org.id, &ids(&[10, 10, 10]))
            .await
            .expect("lookup");
        assert_eq!(users.len(), 1);

        let none = repo
            .list_by_external_ids(org.id, &[])
            .await
            .expect("empty lookup");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn list_by_external_ids_spans_multiple_chunks() {
        let db = setup_db().await;
        let org = insert_org(&db, "org-1").await;
        for external_id in [1, 600, 1_200] {
            insert_user(&db, &org, external_id).await;
        }

        let wanted: Vec<i64> = (1..=1_200).collect();
        let users = db
            .users()
            .list_by_external_ids(org.id, &ids(&wanted))
            .await
            .expect("lookup");
        let found: Vec<i64> = users.iter().map(|user| user.external_id.get()).collect();
        assert_eq!(found, vec![1, 600, 1_200]);
    }

    #[tokio::test]
    async fn insert_reports_duplicates_and_missing_organization() {
        let db = setup_db().await;
        let org = insert_org(&db, "org-1").await;
        insert_user(&db, &org, 10).await;
        let repo = db.users();

        let duplicate = repo
            .insert(&NewUser {
                organization_id: org.id,
                external_id: ExternalUserId(10),
                username: "again",
                email: None,
                created_at: Utc::now(),
            })
            .await;
        assert!(matches!(duplicate, Err(UserError::Duplicate)));

        let orphan = repo
            .insert(&NewUser {
                organization_id: OrganizationId(999),
                external_id: ExternalUserId(1),
                username: "orphan",
                email: Some("orphan@example.com"),
                created_at: Utc::now(),
            })
            .await;
        assert!(matches!(orphan, Err(UserError::MissingOrganization)));
    }

    #[tokio::test]
    async fn fetch_errors_for_missing_user() {
        let db = setup_db().await;
        let err = db.users().fetch(UserId(1)).await.unwrap_err();
        assert!(matches!(err, UserError::NotFound));
        assert!(!err.is_transient());
    }
}
