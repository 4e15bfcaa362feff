use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{query, query_as, FromRow, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::{DeleteOutcome, EntityAdapter, EntityKind, EntityRecord};
use crate::domains::entities::{field_str, push_set, required_str};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::utils::{format_ts, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid};
use crate::validation::ValidationBuilder;

/// Project entity - a job site / engagement field crews are assigned to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub client_name: Option<String>,
    pub status: String,
    pub site_address: Option<String>,
    pub starts_on: Option<String>,
    pub ends_on: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by_user_id: Option<Uuid>,
    pub sync_version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub name: String,
    pub client_name: Option<String>,
    pub status: String,
    pub site_address: Option<String>,
    pub starts_on: Option<String>,
    pub ends_on: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
    pub deleted_at: Option<String>,
    pub deleted_by_user_id: Option<String>,
    pub sync_version: i64,
}

impl TryFrom<ProjectRow> for Project {
    type Error = DomainError;
    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "projects.id")?,
            name: row.name,
            client_name: row.client_name,
            status: row.status,
            site_address: row.site_address,
            starts_on: row.starts_on,
            ends_on: row.ends_on,
            created_at: parse_ts(&row.created_at, "projects.created_at")?,
            updated_at: parse_ts(&row.updated_at, "projects.updated_at")?,
            created_by_user_id: parse_opt_uuid(row.created_by_user_id, "projects.created_by_user_id")?,
            updated_by_user_id: parse_opt_uuid(row.updated_by_user_id, "projects.updated_by_user_id")?,
            deleted_at: parse_opt_ts(row.deleted_at, "projects.deleted_at")?,
            deleted_by_user_id: parse_opt_uuid(row.deleted_by_user_id, "projects.deleted_by_user_id")?,
            sync_version: row.sync_version,
        })
    }
}

impl Project {
    fn into_record(self) -> DomainResult<EntityRecord> {
        let id = self.id;
        let sync_version = self.sync_version;
        let updated_at = self.updated_at;
        let data = serde_json::to_value(&self)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize project: {}", e)))?;
        Ok(EntityRecord {
            kind: EntityKind::Projects,
            id,
            sync_version,
            updated_at,
            data,
        })
    }
}

/// SQLite-backed store adapter for projects
#[derive(Clone)]
pub struct SqliteProjectAdapter {
    pool: SqlitePool,
}

impl SqliteProjectAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> DomainResult<Project> {
        let row = query_as::<_, ProjectRow>(
            "SELECT * FROM projects WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::EntityNotFound("Project".to_string(), id))?;

        Project::try_from(row)
    }
}

#[async_trait]
impl EntityAdapter for SqliteProjectAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Projects
    }

    fn supports_soft_delete(&self) -> bool {
        true
    }

    async fn get(&self, id: Uuid) -> DomainResult<EntityRecord> {
        self.fetch(id).await?.into_record()
    }

    async fn insert(&self, data: &JsonValue, auth: &AuthContext) -> DomainResult<EntityRecord> {
        let name = required_str(data, "name")?;
        ValidationBuilder::new("name", Some(name.clone()))
            .not_blank()
            .max_length(120)
            .validate()?;

        let id = Uuid::new_v4();
        let now = format_ts(&Utc::now());
        let status = field_str(data, "status")?
            .flatten()
            .unwrap_or_else(|| "active".to_string());

        query(
            "INSERT INTO projects (id, name, client_name, status, site_address, starts_on, ends_on, \
             created_at, updated_at, created_by_user_id, updated_by_user_id, sync_version) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(&name)
        .bind(field_str(data, "client_name")?.flatten())
        .bind(&status)
        .bind(field_str(data, "site_address")?.flatten())
        .bind(field_str(data, "starts_on")?.flatten())
        .bind(field_str(data, "ends_on")?.flatten())
        .bind(&now)
        .bind(&now)
        .bind(auth.user_id.to_string())
        .bind(auth.user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        self.get(id).await
    }

    async fn update(
        &self,
        id: Uuid,
        data: &JsonValue,
        auth: &AuthContext,
    ) -> DomainResult<EntityRecord> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE projects SET ");
        let mut any = false;

        if let Some(v) = field_str(data, "name")? {
            let v = v.ok_or_else(|| {
                DomainError::Validation(crate::errors::ValidationError::invalid_value(
                    "name",
                    "must not be null",
                ))
            })?;
            push_set(&mut qb, &mut any, "name");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "status")? {
            let v = v.unwrap_or_else(|| "active".to_string());
            push_set(&mut qb, &mut any, "status");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "client_name")? {
            push_set(&mut qb, &mut any, "client_name");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "site_address")? {
            push_set(&mut qb, &mut any, "site_address");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "starts_on")? {
            push_set(&mut qb, &mut any, "starts_on");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "ends_on")? {
            push_set(&mut qb, &mut any, "ends_on");
            qb.push_bind(v);
        }

        if any {
            qb.push(", ");
        }
        qb.push("updated_at = ");
        qb.push_bind(format_ts(&Utc::now()));
        qb.push(", updated_by_user_id = ");
        qb.push_bind(auth.user_id.to_string());
        qb.push(", sync_version = sync_version + 1 WHERE id = ");
        qb.push_bind(id.to_string());
        qb.push(" AND deleted_at IS NULL");

        let result = qb.build().execute(&self.pool).await.map_err(DbError::from)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("Project".to_string(), id));
        }

        self.get(id).await
    }

    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<DeleteOutcome> {
        let now = format_ts(&Utc::now());
        let result = query(
            "UPDATE projects SET deleted_at = ?, deleted_by_user_id = ?, updated_at = ?, \
             updated_by_user_id = ?, sync_version = sync_version + 1 \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(auth.user_id.to_string())
        .bind(&now)
        .bind(auth.user_id.to_string())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("Project".to_string(), id));
        }
        Ok(DeleteOutcome::SoftDeleted)
    }

    async fn changed_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<EntityRecord>> {
        let rows = query_as::<_, ProjectRow>(
            "SELECT * FROM projects \
             WHERE updated_at > ? \
               AND id IN (SELECT project_id FROM project_assignments WHERE user_id = ?) \
             ORDER BY updated_at ASC",
        )
        .bind(format_ts(&since))
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter()
            .map(|row| Project::try_from(row)?.into_record())
            .collect()
    }
}
