use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{query, query_as, FromRow, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::{DeleteOutcome, EntityAdapter, EntityKind, EntityRecord};
use crate::domains::entities::{field_str, field_uuid, push_set, required_str};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::utils::{format_ts, parse_opt_uuid, parse_ts, parse_uuid};
use crate::validation::ValidationBuilder;

/// Task - a unit of site work assigned to a crew member.
/// Tasks have no soft-delete marker; deletion is final and propagates
/// to other devices through tombstones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub title: String,
    pub status: String,
    pub assignee_id: Option<Uuid>,
    pub due_on: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
    pub sync_version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub status: String,
    pub assignee_id: Option<String>,
    pub due_on: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
    pub sync_version: i64,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;
    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "tasks.id")?,
            project_id: parse_opt_uuid(row.project_id, "tasks.project_id")?,
            title: row.title,
            status: row.status,
            assignee_id: parse_opt_uuid(row.assignee_id, "tasks.assignee_id")?,
            due_on: row.due_on,
            created_at: parse_ts(&row.created_at, "tasks.created_at")?,
            updated_at: parse_ts(&row.updated_at, "tasks.updated_at")?,
            created_by_user_id: parse_opt_uuid(row.created_by_user_id, "tasks.created_by_user_id")?,
            updated_by_user_id: parse_opt_uuid(row.updated_by_user_id, "tasks.updated_by_user_id")?,
            sync_version: row.sync_version,
        })
    }
}

impl Task {
    fn into_record(self) -> DomainResult<EntityRecord> {
        let id = self.id;
        let sync_version = self.sync_version;
        let updated_at = self.updated_at;
        let data = serde_json::to_value(&self)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize task: {}", e)))?;
        Ok(EntityRecord {
            kind: EntityKind::Tasks,
            id,
            sync_version,
            updated_at,
            data,
        })
    }
}

/// SQLite-backed store adapter for tasks
#[derive(Clone)]
pub struct SqliteTaskAdapter {
    pool: SqlitePool,
}

impl SqliteTaskAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> DomainResult<Task> {
        let row = query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("Task".to_string(), id))?;

        Task::try_from(row)
    }
}

#[async_trait]
impl EntityAdapter for SqliteTaskAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Tasks
    }

    fn supports_soft_delete(&self) -> bool {
        false
    }

    async fn get(&self, id: Uuid) -> DomainResult<EntityRecord> {
        self.fetch(id).await?.into_record()
    }

    async fn insert(&self, data: &JsonValue, auth: &AuthContext) -> DomainResult<EntityRecord> {
        let title = required_str(data, "title")?;
        ValidationBuilder::new("title", Some(title.clone()))
            .not_blank()
            .max_length(200)
            .validate()?;

        let id = Uuid::new_v4();
        let now = format_ts(&Utc::now());
        let status = field_str(data, "status")?
            .flatten()
            .unwrap_or_else(|| "open".to_string());

        query(
            "INSERT INTO tasks (id, project_id, title, status, assignee_id, due_on, created_at, \
             updated_at, created_by_user_id, updated_by_user_id, sync_version) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(field_uuid(data, "project_id")?.flatten())
        .bind(&title)
        .bind(&status)
        .bind(field_uuid(data, "assignee_id")?.flatten())
        .bind(field_str(data, "due_on")?.flatten())
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
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tasks SET ");
        let mut any = false;

        if let Some(v) = field_str(data, "title")? {
            let v = v.ok_or_else(|| {
                DomainError::Validation(crate::errors::ValidationError::invalid_value(
                    "title",
                    "must not be null",
                ))
            })?;
            push_set(&mut qb, &mut any, "title");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "status")? {
            let v = v.unwrap_or_else(|| "open".to_string());
            push_set(&mut qb, &mut any, "status");
            qb.push_bind(v);
        }
        if let Some(v) = field_uuid(data, "project_id")? {
            push_set(&mut qb, &mut any, "project_id");
            qb.push_bind(v);
        }
        if let Some(v) = field_uuid(data, "assignee_id")? {
            push_set(&mut qb, &mut any, "assignee_id");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "due_on")? {
            push_set(&mut qb, &mut any, "due_on");
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

        let result = qb.build().execute(&self.pool).await.map_err(DbError::from)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("Task".to_string(), id));
        }

        self.get(id).await
    }

    async fn delete(&self, id: Uuid, _auth: &AuthContext) -> DomainResult<DeleteOutcome> {
        let result = query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("Task".to_string(), id));
        }
        Ok(DeleteOutcome::HardDeleted)
    }

    async fn changed_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<EntityRecord>> {
        let rows = query_as::<_, TaskRow>(
            "SELECT * FROM tasks \
             WHERE updated_at > ? \
               AND (assignee_id = ? \
                    OR project_id IN (SELECT project_id FROM project_assignments WHERE user_id = ?)) \
             ORDER BY updated_at ASC",
        )
        .bind(format_ts(&since))
        .bind(user_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter()
            .map(|row| Task::try_from(row)?.into_record())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserRole;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (SqlitePool, AuthContext) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        crate::db_migration::run_migrations(&pool).await.expect("migrations");
        let auth = AuthContext::new(Uuid::new_v4(), UserRole::FieldOfficer, None);
        (pool, auth)
    }

    #[tokio::test]
    async fn test_delete_is_hard() {
        let (pool, auth) = setup().await;
        let adapter = SqliteTaskAdapter::new(pool);

        let record = adapter
            .insert(&json!({"title": "Stake out north wall"}), &auth)
            .await
            .unwrap();

        let outcome = adapter.delete(record.id, &auth).await.unwrap();
        assert_eq!(outcome, DeleteOutcome::HardDeleted);
        assert!(adapter.get(record.id).await.is_err());
    }
}
