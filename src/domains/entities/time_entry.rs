use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{query, query_as, FromRow, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::{DeleteOutcome, EntityAdapter, EntityKind, EntityRecord};
use crate::domains::entities::{field_bool, field_i64, field_str, field_uuid, push_set, required_str};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::utils::{format_ts, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid};

/// Time entry - a span of work recorded by a field user, usually offline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeEntry {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub user_id: Uuid,
    pub description: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub billable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by_user_id: Option<Uuid>,
    pub sync_version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct TimeEntryRow {
    pub id: String,
    pub project_id: Option<String>,
    pub user_id: String,
    pub description: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub duration_minutes: Option<i64>,
    pub billable: i64,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
    pub deleted_at: Option<String>,
    pub deleted_by_user_id: Option<String>,
    pub sync_version: i64,
}

impl TryFrom<TimeEntryRow> for TimeEntry {
    type Error = DomainError;
    fn try_from(row: TimeEntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "time_entries.id")?,
            project_id: parse_opt_uuid(row.project_id, "time_entries.project_id")?,
            user_id: parse_uuid(&row.user_id, "time_entries.user_id")?,
            description: row.description,
            started_at: parse_ts(&row.started_at, "time_entries.started_at")?,
            ended_at: parse_opt_ts(row.ended_at, "time_entries.ended_at")?,
            duration_minutes: row.duration_minutes,
            billable: row.billable != 0,
            created_at: parse_ts(&row.created_at, "time_entries.created_at")?,
            updated_at: parse_ts(&row.updated_at, "time_entries.updated_at")?,
            created_by_user_id: parse_opt_uuid(row.created_by_user_id, "time_entries.created_by_user_id")?,
            updated_by_user_id: parse_opt_uuid(row.updated_by_user_id, "time_entries.updated_by_user_id")?,
            deleted_at: parse_opt_ts(row.deleted_at, "time_entries.deleted_at")?,
            deleted_by_user_id: parse_opt_uuid(row.deleted_by_user_id, "time_entries.deleted_by_user_id")?,
            sync_version: row.sync_version,
        })
    }
}

impl TimeEntry {
    fn into_record(self) -> DomainResult<EntityRecord> {
        let id = self.id;
        let sync_version = self.sync_version;
        let updated_at = self.updated_at;
        let data = serde_json::to_value(&self)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize time entry: {}", e)))?;
        Ok(EntityRecord {
            kind: EntityKind::TimeEntries,
            id,
            sync_version,
            updated_at,
            data,
        })
    }
}

/// SQLite-backed store adapter for time entries
#[derive(Clone)]
pub struct SqliteTimeEntryAdapter {
    pool: SqlitePool,
}

impl SqliteTimeEntryAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> DomainResult<TimeEntry> {
        let row = query_as::<_, TimeEntryRow>(
            "SELECT * FROM time_entries WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::EntityNotFound("TimeEntry".to_string(), id))?;

        TimeEntry::try_from(row)
    }
}

#[async_trait]
impl EntityAdapter for SqliteTimeEntryAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::TimeEntries
    }

    fn supports_soft_delete(&self) -> bool {
        true
    }

    async fn get(&self, id: Uuid) -> DomainResult<EntityRecord> {
        self.fetch(id).await?.into_record()
    }

    async fn insert(&self, data: &JsonValue, auth: &AuthContext) -> DomainResult<EntityRecord> {
        let started_raw = required_str(data, "started_at")?;
        let started_at = parse_ts(&started_raw, "started_at")?;

        let ended_at = match field_str(data, "ended_at")?.flatten() {
            Some(s) => Some(parse_ts(&s, "ended_at")?),
            None => None,
        };

        let id = Uuid::new_v4();
        let now = format_ts(&Utc::now());

        query(
            "INSERT INTO time_entries (id, project_id, user_id, description, started_at, ended_at, \
             duration_minutes, billable, created_at, updated_at, created_by_user_id, \
             updated_by_user_id, sync_version) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(field_uuid(data, "project_id")?.flatten())
        .bind(auth.user_id.to_string())
        .bind(field_str(data, "description")?.flatten())
        .bind(format_ts(&started_at))
        .bind(ended_at.map(|t| format_ts(&t)))
        .bind(field_i64(data, "duration_minutes")?.flatten())
        .bind(field_bool(data, "billable")?.unwrap_or(true) as i64)
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
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE time_entries SET ");
        let mut any = false;

        if let Some(v) = field_uuid(data, "project_id")? {
            push_set(&mut qb, &mut any, "project_id");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "description")? {
            push_set(&mut qb, &mut any, "description");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "started_at")? {
            let v = v.ok_or_else(|| {
                DomainError::Validation(crate::errors::ValidationError::invalid_value(
                    "started_at",
                    "must not be null",
                ))
            })?;
            let parsed = parse_ts(&v, "started_at")?;
            push_set(&mut qb, &mut any, "started_at");
            qb.push_bind(format_ts(&parsed));
        }
        if let Some(v) = field_str(data, "ended_at")? {
            let formatted = match v {
                Some(s) => Some(format_ts(&parse_ts(&s, "ended_at")?)),
                None => None,
            };
            push_set(&mut qb, &mut any, "ended_at");
            qb.push_bind(formatted);
        }
        if let Some(v) = field_i64(data, "duration_minutes")? {
            push_set(&mut qb, &mut any, "duration_minutes");
            qb.push_bind(v);
        }
        if let Some(v) = field_bool(data, "billable")? {
            push_set(&mut qb, &mut any, "billable");
            qb.push_bind(v as i64);
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
            return Err(DomainError::EntityNotFound("TimeEntry".to_string(), id));
        }

        self.get(id).await
    }

    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<DeleteOutcome> {
        let now = format_ts(&Utc::now());
        let result = query(
            "UPDATE time_entries SET deleted_at = ?, deleted_by_user_id = ?, updated_at = ?, \
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
            return Err(DomainError::EntityNotFound("TimeEntry".to_string(), id));
        }
        Ok(DeleteOutcome::SoftDeleted)
    }

    async fn changed_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<EntityRecord>> {
        let rows = query_as::<_, TimeEntryRow>(
            "SELECT * FROM time_entries \
             WHERE updated_at > ? \
               AND (user_id = ? \
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
            .map(|row| TimeEntry::try_from(row)?.into_record())
            .collect()
    }
}
