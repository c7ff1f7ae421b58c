use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use oncall_core::{Organization, OrganizationId};

use crate::{is_unique_violation, to_rfc3339};

const COLUMNS: &str = "id, org_id, uuid, name, created_at";

/// Repository for organizations synced from the identity provider.
#[derive(Clone)]
pub struct OrganizationRepository {
    pool: SqlitePool,
}

impl OrganizationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts an organization and assigns it a fresh UUID.
    pub async fn insert(
        &self,
        record: &NewOrganization<'_>,
    ) -> Result<Organization, OrganizationError> {
        let query = format!(
            "INSERT INTO organizations (org_id, uuid, name, created_at) \
             VALUES (?, ?, ?, ?) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, OrganizationRow>(&query)
            .bind(record.org_id)
            .bind(Uuid::new_v4().to_string())
            .bind(record.name)
            .bind(to_rfc3339(record.created_at))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    OrganizationError::Duplicate
                } else {
                    OrganizationError::Database(err)
                }
            })?;

        row.into_domain()
    }

    /// Loads an organization by internal id.
    pub async fn fetch(&self, id: OrganizationId) -> Result<Organization, OrganizationError> {
        let query = format!("SELECT {COLUMNS} FROM organizations WHERE id = ?");
        sqlx::query_as::<_, OrganizationRow>(&query)
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(OrganizationError::NotFound)?
            .into_domain()
    }

    /// Loads an organization by its public UUID.
    pub async fn fetch_by_uuid(&self, uuid: Uuid) -> Result<Organization, OrganizationError> {
        let query = format!("SELECT {COLUMNS} FROM organizations WHERE uuid = ?");
        sqlx::query_as::<_, OrganizationRow>(&query)
            .bind(uuid.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(OrganizationError::NotFound)?
            .into_domain()
    }
}

/// Data required to create an organization.
pub struct NewOrganization<'a> {
    pub org_id: &'a str,
    pub name: &'a str,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct OrganizationRow {
    id: i64,
    org_id: String,
    uuid: Option<String>,
    name: String,
    created_at: DateTime<Utc>,
}

impl OrganizationRow {
    fn into_domain(self) -> Result<Organization, OrganizationError> {
        let raw = self.uuid.unwrap_or_default();
        let uuid = Uuid::parse_str(&raw).map_err(|_| OrganizationError::InvalidUuid(raw))?;
        Ok(Organization {
            id: OrganizationId(self.id),
            org_id: self.org_id,
            uuid,
            name: self.name,
            created_at: self.created_at,
        })
    }
}

/// Errors that can occur while reading or writing organizations.
#[derive(Debug, Error)]
pub enum OrganizationError {
    #[error("organization not found")]
    NotFound,
    #[error("organization with the same org_id already exists")]
    Duplicate,
    #[error("organization has a malformed uuid: {0:?}")]
    InvalidUuid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_org, setup_db};
    use crate::Database;

    #[tokio::test]
    async fn insert_assigns_unique_uuids() {
        let db = setup_db().await;
        let first = insert_org(&db, "org-1").await;
        let second = insert_org(&db, "org-2").await;

        assert_ne!(first.uuid, second.uuid);
        assert_eq!(first.uuid.get_version_num(), 4);

        let loaded = db
            .organizations()
            .fetch_by_uuid(second.uuid)
            .await
            .expect("fetch by uuid");
        assert_eq!(loaded, second);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_org_id() {
        let db = setup_db().await;
        insert_org(&db, "org-1").await;

        let err = db
            .organizations()
            .insert(&NewOrganization {
                org_id: "org-1",
                name: "Again",
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrganizationError::Duplicate));
    }

    #[tokio::test]
    async fn fetch_errors_for_missing_organization() {
        let db = setup_db().await;
        let repo = db.organizations();

        assert!(matches!(
            repo.fetch(OrganizationId(404)).await,
            Err(OrganizationError::NotFound)
        ));
        assert!(matches!(
            repo.fetch_by_uuid(Uuid::new_v4()).await,
            Err(OrganizationError::NotFound)
        ));
    }

    #[tokio::test]
    async fn migration_generates_uuid_for_rows_inserted_without_one() {
        let db = setup_db().await;
        sqlx::query(
            "INSERT INTO organizations (org_id, name, created_at) \
             VALUES ('legacy', 'Legacy', '2022-12-05T07:00:00.000Z')",
        )
        .execute(db.pool())
        .await
        .expect("insert legacy organization");

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM organizations WHERE org_id = 'legacy'")
            .fetch_one(db.pool())
            .await
            .expect("legacy id");
        let org = db
            .organizations()
            .fetch(OrganizationId(id))
            .await
            .expect("uuid should be generated");
        assert_eq!(org.uuid.get_version_num(), 4);
        assert_eq!(org.uuid.to_string().len(), 36);
    }

    #[tokio::test]
    async fn uuid_migration_backfills_existing_rows() {
        use sqlx::Executor;

        let db = Database::connect("sqlite::memory:").await.expect("connect");
        db.pool()
            .execute(include_str!("../../../migrations/0001_core_tables.sql"))
            .await
            .expect("apply core tables");
        for org_id in ["legacy-1", "legacy-2"] {
            sqlx::query(
                "INSERT INTO organizations (org_id, name, created_at) \
                 VALUES (?, 'Legacy', '2022-12-05T07:00:00.000Z')",
            )
            .bind(org_id)
            .execute(db.pool())
            .await
            .expect("insert legacy organization");
        }

        db.pool()
            .execute(include_str!("../../../migrations/0002_organization_uuid.sql"))
            .await
            .expect("apply uuid migration");

        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT org_id, uuid FROM organizations ORDER BY id")
                .fetch_all(db.pool())
                .await
                .expect("load organizations");
        assert_eq!(rows.len(), 2);
        let uuids: Vec<Uuid> = rows
            .iter()
            .map(|(org_id, raw)| {
                let raw = raw.as_deref().unwrap_or_else(|| panic!("{org_id} has no uuid"));
                Uuid::parse_str(raw).expect("backfilled uuid parses")
            })
            .collect();
        assert!(uuids.iter().all(|uuid| uuid.get_version_num() == 4));
        assert_ne!(uuids[0], uuids[1]);
    }

    #[tokio::test]
    async fn uuid_is_not_editable() {
        let db = setup_db().await;
        let org = insert_org(&db, "org-1").await;

        let result = sqlx::query("UPDATE organizations SET uuid = ? WHERE id = ?")
            .bind(Uuid::new_v4().to_string())
            .bind(org.id.get())
            .execute(db.pool())
            .await;
        assert!(result.is_err(), "uuid update should be rejected");

        sqlx::query("UPDATE organizations SET name = 'Renamed' WHERE id = ?")
            .bind(org.id.get())
            .execute(db.pool())
            .await
            .expect("other columns stay editable");
        let reloaded = db.organizations().fetch(org.id).await.expect("fetch");
        assert_eq!(reloaded.uuid, org.uuid);
        assert_eq!(reloaded.name, "Renamed");
    }
}
