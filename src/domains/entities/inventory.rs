use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{query, query_as, FromRow, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::{DeleteOutcome, EntityAdapter, EntityKind, EntityRecord};
use crate::domains::entities::{field_i64, field_str, push_set, required_str};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::utils::{format_ts, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid};
use crate::validation::ValidationBuilder;

/// Inventory item - organization-wide stock tracked across sites
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: Uuid,
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit: Option<String>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by_user_id: Option<Uuid>,
    pub updated_by_user_id: Option<Uuid>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by_user_id: Option<Uuid>,
    pub sync_version: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct InventoryItemRow {
    pub id: String,
    pub name: String,
    pub sku: Option<String>,
    pub quantity: i64,
    pub unit: Option<String>,
    pub location: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub created_by_user_id: Option<String>,
    pub updated_by_user_id: Option<String>,
    pub deleted_at: Option<String>,
    pub deleted_by_user_id: Option<String>,
    pub sync_version: i64,
}

impl TryFrom<InventoryItemRow> for InventoryItem {
    type Error = DomainError;
    fn try_from(row: InventoryItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "inventory_items.id")?,
            name: row.name,
            sku: row.sku,
            quantity: row.quantity,
            unit: row.unit,
            location: row.location,
            created_at: parse_ts(&row.created_at, "inventory_items.created_at")?,
            updated_at: parse_ts(&row.updated_at, "inventory_items.updated_at")?,
            created_by_user_id: parse_opt_uuid(row.created_by_user_id, "inventory_items.created_by_user_id")?,
            updated_by_user_id: parse_opt_uuid(row.updated_by_user_id, "inventory_items.updated_by_user_id")?,
            deleted_at: parse_opt_ts(row.deleted_at, "inventory_items.deleted_at")?,
            deleted_by_user_id: parse_opt_uuid(row.deleted_by_user_id, "inventory_items.deleted_by_user_id")?,
            sync_version: row.sync_version,
        })
    }
}

impl InventoryItem {
    fn into_record(self) -> DomainResult<EntityRecord> {
        let id = self.id;
        let sync_version = self.sync_version;
        let updated_at = self.updated_at;
        let data = serde_json::to_value(&self).map_err(|e| {
            DomainError::Internal(format!("Failed to serialize inventory item: {}", e))
        })?;
        Ok(EntityRecord {
            kind: EntityKind::InventoryItems,
            id,
            sync_version,
            updated_at,
            data,
        })
    }
}

/// SQLite-backed store adapter for inventory items
#[derive(Clone)]
pub struct SqliteInventoryAdapter {
    pool: SqlitePool,
}

impl SqliteInventoryAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> DomainResult<InventoryItem> {
        let row = query_as::<_, InventoryItemRow>(
            "SELECT * FROM inventory_items WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?
        .ok_or_else(|| DomainError::EntityNotFound("InventoryItem".to_string(), id))?;

        InventoryItem::try_from(row)
    }
}

#[async_trait]
impl EntityAdapter for SqliteInventoryAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::InventoryItems
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

        query(
            "INSERT INTO inventory_items (id, name, sku, quantity, unit, location, created_at, \
             updated_at, created_by_user_id, updated_by_user_id, sync_version) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(id.to_string())
        .bind(&name)
        .bind(field_str(data, "sku")?.flatten())
        .bind(field_i64(data, "quantity")?.flatten().unwrap_or(0))
        .bind(field_str(data, "unit")?.flatten())
        .bind(field_str(data, "location")?.flatten())
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
        let delta = field_i64(data, "quantity_delta")?.flatten();
        let absolute = field_i64(data, "quantity")?.flatten();
        if delta.is_some() && absolute.is_some() {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "quantity",
                "provide either quantity or quantity_delta, not both",
            )));
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE inventory_items SET ");
        let mut any = false;

        if let Some(v) = field_str(data, "name")? {
            let v = v.ok_or_else(|| {
                DomainError::Validation(ValidationError::invalid_value("name", "must not be null"))
            })?;
            push_set(&mut qb, &mut any, "name");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "sku")? {
            push_set(&mut qb, &mut any, "sku");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "unit")? {
            push_set(&mut qb, &mut any, "unit");
            qb.push_bind(v);
        }
        if let Some(v) = field_str(data, "location")? {
            push_set(&mut qb, &mut any, "location");
            qb.push_bind(v);
        }
        if let Some(v) = absolute {
            push_set(&mut qb, &mut any, "quantity");
            qb.push_bind(v);
        }
        // Stock adjustments must stay in SQL arithmetic, never read-then-write
        if let Some(d) = delta {
            push_set(&mut qb, &mut any, "quantity");
            qb.push("quantity + ");
            qb.push_bind(d);
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
            return Err(DomainError::EntityNotFound("InventoryItem".to_string(), id));
        }

        self.get(id).await
    }

    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<DeleteOutcome> {
        let now = format_ts(&Utc::now());
        let result = query(
            "UPDATE inventory_items SET deleted_at = ?, deleted_by_user_id = ?, updated_at = ?, \
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
            return Err(DomainError::EntityNotFound("InventoryItem".to_string(), id));
        }
        Ok(DeleteOutcome::SoftDeleted)
    }

    async fn changed_since(
        &self,
        _user_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<EntityRecord>> {
        // Inventory is organization-wide stock; every syncing user sees it.
        let rows = query_as::<_, InventoryItemRow>(
            "SELECT * FROM inventory_items WHERE updated_at > ? ORDER BY updated_at ASC",
        )
        .bind(format_ts(&since))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter()
            .map(|row| InventoryItem::try_from(row)?.into_record())
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
    async fn test_quantity_delta_is_atomic_increment() {
        let (pool, auth) = setup().await;
        let adapter = SqliteInventoryAdapter::new(pool);

        let record = adapter
            .insert(&json!({"name": "Rebar tie wire", "quantity": 10}), &auth)
            .await
            .unwrap();

        adapter
            .update(record.id, &json!({"quantity_delta": -3}), &auth)
            .await
            .unwrap();
        let updated = adapter
            .update(record.id, &json!({"quantity_delta": 5}), &auth)
            .await
            .unwrap();

        assert_eq!(updated.data["quantity"], json!(12));
        assert_eq!(updated.sync_version, 2);
    }

    #[tokio::test]
    async fn test_delta_and_absolute_quantity_conflict() {
        let (pool, auth) = setup().await;
        let adapter = SqliteInventoryAdapter::new(pool);

        let record = adapter
            .insert(&json!({"name": "Gloves"}), &auth)
            .await
            .unwrap();

        let err = adapter
            .update(record.id, &json!({"quantity": 4, "quantity_delta": 1}), &auth)
            .await;
        assert!(err.is_err());
    }
}
