use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{query, query_as, FromRow, QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::{DeleteOutcome, EntityAdapter, EntityKind, EntityRecord};
use crate::domains::entities::{field_decimal, field_str, field_uuid, push_set};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::utils::{format_ts, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid};

/// Expense - a cost recorded against a project by a field user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expense {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub category: Option<String>,
    pub memo: Option<String>,
    pub incurred_on: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by_user_id: Option<Uuid>,
    pub sync_version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExpenseRow {
    pub id: String,
    pub project_id: Option<String>,
    pub user_id: String,
    pub amount: String,
    pub currency: String,
    pub category: Option<String>,
    pub memo: Option<String>,
    pub incurred_on: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
    pub deleted_at: Option<String>,
    pub deleted_by_user_id: Option<String>,
    pub sync_version: i64,
}

impl TryFrom<ExpenseRow> for Expense {
    type Error = DomainError;
    fn try_from(row: ExpenseRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "expenses.id")?,
            project_id: parse_opt_uuid(row.project_id, "expenses.project_id")?,
            user_id: parse_uuid(&row.user_id, "expenses.user_id")?,
            amount: Decimal::from_str(&row.amount).map_err(|_| {
                DomainError::Validation(ValidationError::format(
                    "expenses.amount",
                    "invalid decimal",
                ))
            })?,
            currency: row.currency,
            category: row.category,
            memo: row.memo,
            incurred_on: row.incurred_on,
            created_at: parse_ts(&row.created_at, "expenses.created_at")?,
            updated_at: parse_ts(&row.updated_at, "expenses.updated_at")?,
            created_by_user_id: parse_opt_uuid(row.created_by_user_id, "expenses.created_by_user_id")?,
            updated_by_user_id: parse_opt_uuid(row.updated_by_user_id, "expenses.updated_by_user_id")?,
            deleted_at: parse_opt_ts(row.deleted_at, "expenses.deleted_at")?,
            deleted_by_user_id: parse_opt_uuid(row.deleted_by_user_id, "expenses.deleted_by_user_id")?,
            sync_version: row.sync_version,
        })
    }
}

impl Expense {
    fn into_record(self) -> DomainResult<EntityRecord> {
        let id = self.id;
        let sync_version = self.sync_version;
        let updated_at = self.updated_at;
        let data = serde_json::to_value(&self)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize expense: {}", e)))?;
        Ok(EntityRecord {
            kind: EntityKind::Expenses,
            id,
            sync_version,
            updated_at,
            data,
        })
    }
}

/// SQLite-backed store adapter for expenses
#[derive(Clone)]
pub struct SqliteExpenseAdapter {
    pool: SqlitePool,
}

impl SqliteExpenseAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> DomainResult<Expense> {
        let row = query_as::<_, ExpenseRow>(
            "SELECT * FROM expenses WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::EntityNotFound("Expense".to_string(), id))?;

        Expense::try_from(row)
    }
}

#[async_trait]
impl EntityAdapter for SqliteExpenseAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Expenses
    }

    fn supports_soft_delete(&self) -> bool {
        true
    }

    async fn get(&self, id: Uuid) -> DomainResult<EntityRecord> {
        self.fetch(id).await?.into_record()
    }

    async fn insert(&self, data: &JsonValue, auth: &AuthContext) -> DomainResult<EntityRecord> {
        let amount = field_decimal(data, "amount")?
            .ok_or_else(|| DomainError::Validation(ValidationError::required("amount")))?;

        let id = Uuid::new_v4();
        let now = format_ts(&Utc::now());
        let currency = field_str(data, "currency")?
            .flatten()
            .unwrap_or_else(|| "USD".to_string());

        query(
            "INSERT INTO expenses (id, project_id, user_id, amount, currency, category, memo, \
             incurred_on, created_at, updated_at, created_by_user_id, updated_by_user_id, \
             sync_version) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(field_uuid(data, "project_id")?.flatten())
        .bind(auth.user_id.to_string())
        .bind(amount.to_string())
        .bind(&currency)
        .bind(field_str(data, "category")?.flatten())
        .bind(field_str(data, "memo")?.flatten())
        .bind(field_str(data, "incurred_on")?.flatten())
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
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE expenses SET ");
        let mut any = false;

        if let Some(v) = field_decimal(data, "amount")? {
            push_set(&mut qb, &mut any, "amount");
            qb.push_bind(v.to_string());
        }
        if let Some(v) = field_uuid(data, "project_id")? {
            push_set(&mut qb, &mut any, "project_id");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "currency")? {
            let v = v.unwrap_or_else(|| "USD".to_string());
            push_set(&mut qb, &mut any, "currency");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "category")? {
            push_set(&mut qb, &mut any, "category");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "memo")? {
            push_set(&mut qb, &mut any, "memo");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "incurred_on")? {
            push_set(&mut qb, &mut any, "incurred_on");
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
            return Err(DomainError::EntityNotFound("Expense".to_string(), id));
        }

        self.get(id).await
    }

    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<DeleteOutcome> {
        let now = format_ts(&Utc::now());
        let result = query(
            "UPDATE expenses SET deleted_at = ?, deleted_by_user_id = ?, updated_at = ?, \
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
            return Err(DomainError::EntityNotFound("Expense".to_string(), id));
        }
        Ok(DeleteOutcome::SoftDeleted)
    }

    async fn changed_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<EntityRecord>> {
        let rows = query_as::<_, ExpenseRow>(
            "SELECT * FROM expenses \
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
            .map(|row| Expense::try_from(row)?.into_record())
            .collect()
    }
}
