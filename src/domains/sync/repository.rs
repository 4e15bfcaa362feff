use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, QueryBuilder, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::domains::sync::types::{
    ConflictResolution, NewQueueItem, ServiceHealth, ServiceHealthRow, SyncConflict,
    SyncConflictRow, SyncLogEntry, SyncLogEntryRow, SyncLogFilter, SyncQueueItem,
    SyncQueueItemRow, SyncQueueStatus, Tombstone, TombstoneRow,
};
use crate::errors::{DbError, DomainError, DomainResult, SyncError};
use crate::types::PaginationParams;
use crate::utils::{format_ts, parse_opt_ts};

/// Repository for the outbound sync queue
#[async_trait]
pub trait SyncQueueRepository: Send + Sync {
    /// Upsert a work item. While a pending item exists for the same
    /// (entity_type, entity_id), the new request overwrites its action,
    /// target, priority and payload instead of creating a duplicate.
    async fn enqueue(&self, new: &NewQueueItem) -> DomainResult<SyncQueueItem>;

    /// Claim up to `limit` due retryable items, transitioning them to
    /// `syncing`. Safe to call from overlapping ticks; each item is claimed
    /// by at most one caller.
    async fn claim_due(&self, limit: u32, now: DateTime<Utc>) -> DomainResult<Vec<SyncQueueItem>>;

    /// Transition a claimed item to its terminal success state
    async fn mark_synced(&self, id: Uuid) -> DomainResult<()>;

    /// Record a failed attempt, transitioning to `failed` once the attempt
    /// ceiling is reached and to retryable `error` (rescheduled at
    /// `retry_at`) otherwise. Returns the resulting status.
    async fn record_failed_attempt(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> DomainResult<SyncQueueStatus>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<SyncQueueItem>;

    async fn status_counts(&self) -> DomainResult<HashMap<SyncQueueStatus, i64>>;

    /// Timestamp of the most recent successful delivery
    async fn last_synced_at(&self) -> DomainResult<Option<DateTime<Utc>>>;
}

/// Repository for the append-only delivery audit log
#[async_trait]
pub trait SyncLogRepository: Send + Sync {
    async fn record(&self, entry: &SyncLogEntry) -> DomainResult<()>;

    async fn query_entries(
        &self,
        filter: &SyncLogFilter,
        params: PaginationParams,
    ) -> DomainResult<Vec<SyncLogEntry>>;

    /// Retention housekeeping; returns the number of purged entries
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64>;

    /// Per-target-service delivery health, counting errors newer than
    /// `error_window_start`
    async fn service_health(
        &self,
        error_window_start: DateTime<Utc>,
    ) -> DomainResult<Vec<ServiceHealth>>;
}

/// Repository for persisted sync conflicts
#[async_trait]
pub trait ConflictRepository: Send + Sync {
    async fn create(&self, conflict: &SyncConflict) -> DomainResult<()>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<SyncConflict>;

    async fn list_pending_for_user(&self, user_id: Uuid) -> DomainResult<Vec<SyncConflict>>;

    /// Transition a pending conflict to resolved. Errors if the conflict
    /// was already resolved.
    async fn mark_resolved(
        &self,
        id: Uuid,
        resolution: ConflictResolution,
        resolved_at: DateTime<Utc>,
    ) -> DomainResult<()>;
}

/// Repository for tombstone records
#[async_trait]
pub trait TombstoneRepository: Send + Sync {
    async fn create(&self, tombstone: &Tombstone) -> DomainResult<()>;

    async fn find_since(&self, since: DateTime<Utc>) -> DomainResult<Vec<Tombstone>>;
}

/// SQLite implementation of the SyncQueueRepository
pub struct SqliteSyncQueueRepository {
    pool: SqlitePool,
}

impl SqliteSyncQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncQueueRepository for SqliteSyncQueueRepository {
    async fn enqueue(&self, new: &NewQueueItem) -> DomainResult<SyncQueueItem> {
        let now = format_ts(&Utc::now());
        let payload = new
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DomainError::Internal(format!("Failed to serialize payload: {}", e)))?;

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let updated = query(
            "UPDATE sync_queue SET action = ?, target_service = ?, priority = ?, payload = ?, \
             scheduled_at = ?, updated_at = ? \
             WHERE entity_type = ? AND entity_id = ? AND status = 'pending'",
        )
        .bind(new.action.as_str())
        .bind(&new.target_service)
        .bind(new.priority)
        .bind(&payload)
        .bind(&now)
        .bind(&now)
        .bind(new.entity_type.as_str())
        .bind(new.entity_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        if updated.rows_affected() == 0 {
            let inserted = query(
                "INSERT INTO sync_queue (id, entity_type, entity_id, action, target_service, \
                 priority, status, attempts, max_attempts, payload, scheduled_at, created_at, \
                 updated_at) VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(new.entity_type.as_str())
            .bind(new.entity_id.to_string())
            .bind(new.action.as_str())
            .bind(&new.target_service)
            .bind(new.priority)
            .bind(new.max_attempts)
            .bind(&payload)
            .bind(&now)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await;

            if let Err(insert_err) = inserted {
                // Lost an insert race against the pending-unique index;
                // fold this request into the row that won.
                let retried = query(
                    "UPDATE sync_queue SET action = ?, target_service = ?, priority = ?, \
                     payload = ?, scheduled_at = ?, updated_at = ? \
                     WHERE entity_type = ? AND entity_id = ? AND status = 'pending'",
                )
                .bind(new.action.as_str())
                .bind(&new.target_service)
                .bind(new.priority)
                .bind(&payload)
                .bind(&now)
                .bind(&now)
                .bind(new.entity_type.as_str())
                .bind(new.entity_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;

                if retried.rows_affected() == 0 {
                    return Err(DbError::from(insert_err).into());
                }
            }
        }

        let row = query_as::<_, SyncQueueItemRow>(
            "SELECT * FROM sync_queue \
             WHERE entity_type = ? AND entity_id = ? AND status = 'pending'",
        )
        .bind(new.entity_type.as_str())
        .bind(new.entity_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;

        SyncQueueItem::try_from(row)
    }

    async fn claim_due(&self, limit: u32, now: DateTime<Utc>) -> DomainResult<Vec<SyncQueueItem>> {
        let due_ids: Vec<String> = query_scalar(
            "SELECT id FROM sync_queue \
             WHERE status IN ('pending', 'error') AND scheduled_at <= ? \
             ORDER BY priority ASC, scheduled_at ASC LIMIT ?",
        )
        .bind(format_ts(&now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let mut claimed = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            let result = query(
                "UPDATE sync_queue SET status = 'syncing', updated_at = ? \
                 WHERE id = ? AND status IN ('pending', 'error')",
            )
            .bind(format_ts(&Utc::now()))
            .bind(&id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

            if result.rows_affected() == 1 {
                let row = query_as::<_, SyncQueueItemRow>("SELECT * FROM sync_queue WHERE id = ?")
                    .bind(&id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(DbError::from)?;
                claimed.push(SyncQueueItem::try_from(row)?);
            }
        }

        Ok(claimed)
    }

    async fn mark_synced(&self, id: Uuid) -> DomainResult<()> {
        let now = format_ts(&Utc::now());
        let result = query(
            "UPDATE sync_queue SET status = 'synced', processed_at = ?, updated_at = ? \
             WHERE id = ? AND status = 'syncing'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("SyncQueueItem".to_string(), id.to_string()).into());
        }
        Ok(())
    }

    async fn record_failed_attempt(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> DomainResult<SyncQueueStatus> {
        let now = format_ts(&Utc::now());
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let result = query(
            "UPDATE sync_queue SET \
                attempts = attempts + 1, \
                last_error = ?, \
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'error' END, \
                scheduled_at = CASE WHEN attempts + 1 >= max_attempts THEN scheduled_at ELSE ? END, \
                processed_at = CASE WHEN attempts + 1 >= max_attempts THEN ? ELSE processed_at END, \
                updated_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(format_ts(&retry_at))
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound("SyncQueueItem".to_string(), id.to_string()).into());
        }

        let status: String = query_scalar("SELECT status FROM sync_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;

        SyncQueueStatus::from_str(&status)
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<SyncQueueItem> {
        let row = query_as::<_, SyncQueueItemRow>("SELECT * FROM sync_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DbError::NotFound("SyncQueueItem".to_string(), id.to_string()))?;

        SyncQueueItem::try_from(row)
    }

    async fn status_counts(&self) -> DomainResult<HashMap<SyncQueueStatus, i64>> {
        let rows: Vec<(String, i64)> =
            query_as("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::from)?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            counts.insert(SyncQueueStatus::from_str(&status)?, count);
        }
        Ok(counts)
    }

    async fn last_synced_at(&self) -> DomainResult<Option<DateTime<Utc>>> {
        let raw: Option<String> =
            query_scalar("SELECT MAX(processed_at) FROM sync_queue WHERE status = 'synced'")
                .fetch_one(&self.pool)
                .await
                .map_err(DbError::from)?;

        parse_opt_ts(raw, "sync_queue.processed_at")
    }
}

/// SQLite implementation of the SyncLogRepository
pub struct SqliteSyncLogRepository {
    pool: SqlitePool,
}

impl SqliteSyncLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncLogRepository for SqliteSyncLogRepository {
    async fn record(&self, entry: &SyncLogEntry) -> DomainResult<()> {
        let request_snapshot = entry
            .request_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DomainError::Internal(format!("Failed to serialize snapshot: {}", e)))?;
        let response_snapshot = entry
            .response_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DomainError::Internal(format!("Failed to serialize snapshot: {}", e)))?;

        query(
            "INSERT INTO sync_log (id, entity_type, entity_id, direction, target_service, \
             action, status, request_snapshot, response_snapshot, error_message, duration_ms, \
             timestamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.entity_type)
        .bind(entry.entity_id.to_string())
        .bind(entry.direction.as_str())
        .bind(&entry.target_service)
        .bind(&entry.action)
        .bind(entry.status.as_str())
        .bind(request_snapshot)
        .bind(response_snapshot)
        .bind(&entry.error_message)
        .bind(entry.duration_ms)
        .bind(format_ts(&entry.timestamp))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn query_entries(
        &self,
        filter: &SyncLogFilter,
        params: PaginationParams,
    ) -> DomainResult<Vec<SyncLogEntry>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM sync_log WHERE 1 = 1");

        if let Some(entity_type) = &filter.entity_type {
            qb.push(" AND entity_type = ");
            qb.push_bind(entity_type.clone());
        }
        if let Some(target_service) = &filter.target_service {
            qb.push(" AND target_service = ");
            qb.push_bind(target_service.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ");
            qb.push_bind(status.as_str());
        }

        qb.push(" ORDER BY timestamp DESC LIMIT ");
        qb.push_bind(params.limit as i64);
        qb.push(" OFFSET ");
        qb.push_bind(params.offset as i64);

        let rows = qb
            .build_query_as::<SyncLogEntryRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(SyncLogEntry::try_from).collect()
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> DomainResult<u64> {
        let result = query("DELETE FROM sync_log WHERE timestamp < ?")
            .bind(format_ts(&cutoff))
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }

    async fn service_health(
        &self,
        error_window_start: DateTime<Utc>,
    ) -> DomainResult<Vec<ServiceHealth>> {
        let rows = query_as::<_, ServiceHealthRow>(
            "SELECT target_service, \
                    MAX(CASE WHEN status = 'success' THEN timestamp END) AS last_success_at, \
                    SUM(CASE WHEN status = 'error' AND timestamp > ? THEN 1 ELSE 0 END) AS recent_errors \
             FROM sync_log \
             WHERE direction = 'outbound' \
             GROUP BY target_service \
             ORDER BY target_service",
        )
        .bind(format_ts(&error_window_start))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(ServiceHealth::try_from).collect()
    }
}

/// SQLite implementation of the ConflictRepository
pub struct SqliteConflictRepository {
    pool: SqlitePool,
}

impl SqliteConflictRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConflictRepository for SqliteConflictRepository {
    async fn create(&self, conflict: &SyncConflict) -> DomainResult<()> {
        let client_data = serde_json::to_string(&conflict.client_data)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize client data: {}", e)))?;
        let server_data = serde_json::to_string(&conflict.server_data)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize server data: {}", e)))?;

        query(
            "INSERT INTO sync_conflicts (id, entity_type, entity_id, client_data, client_time, \
             server_data, user_id, status, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conflict.id.to_string())
        .bind(conflict.entity_type.as_str())
        .bind(conflict.entity_id.to_string())
        .bind(client_data)
        .bind(format_ts(&conflict.client_time))
        .bind(server_data)
        .bind(conflict.user_id.to_string())
        .bind(conflict.status.as_str())
        .bind(format_ts(&conflict.created_at))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<SyncConflict> {
        let row = query_as::<_, SyncConflictRow>("SELECT * FROM sync_conflicts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("SyncConflict".to_string(), id))?;

        SyncConflict::try_from(row)
    }

    async fn list_pending_for_user(&self, user_id: Uuid) -> DomainResult<Vec<SyncConflict>> {
        let rows = query_as::<_, SyncConflictRow>(
            "SELECT * FROM sync_conflicts WHERE user_id = ? AND status = 'pending' \
             ORDER BY created_at ASC",
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(SyncConflict::try_from).collect()
    }

    async fn mark_resolved(
        &self,
        id: Uuid,
        resolution: ConflictResolution,
        resolved_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let result = query(
            "UPDATE sync_conflicts SET status = 'resolved', resolution = ?, resolved_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(resolution.as_str())
        .bind(format_ts(&resolved_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::Sync(SyncError::AlreadyResolved(id)));
        }
        Ok(())
    }
}

/// SQLite implementation of the TombstoneRepository
pub struct SqliteTombstoneRepository {
    pool: SqlitePool,
}

impl SqliteTombstoneRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TombstoneRepository for SqliteTombstoneRepository {
    async fn create(&self, tombstone: &Tombstone) -> DomainResult<()> {
        query(
            "INSERT INTO tombstones (id, entity_type, entity_id, deleted_by, deleted_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(tombstone.id.to_string())
        .bind(tombstone.entity_type.as_str())
        .bind(tombstone.entity_id.to_string())
        .bind(tombstone.deleted_by.map(|u| u.to_string()))
        .bind(format_ts(&tombstone.deleted_at))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn find_since(&self, since: DateTime<Utc>) -> DomainResult<Vec<Tombstone>> {
        let rows = query_as::<_, TombstoneRow>(
            "SELECT * FROM tombstones WHERE deleted_at > ? ORDER BY deleted_at ASC",
        )
        .bind(format_ts(&since))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(Tombstone::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::{ChangeAction, EntityKind};
    use crate::domains::sync::types::{DEFAULT_MAX_ATTEMPTS, PRIORITY_NORMAL};
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        crate::db_migration::run_migrations(&pool).await.expect("migrations");
        pool
    }

    fn new_item(entity_id: Uuid, priority: i64, payload: serde_json::Value) -> NewQueueItem {
        NewQueueItem {
            entity_type: EntityKind::Projects,
            entity_id,
            action: ChangeAction::Update,
            target_service: "crm".to_string(),
            priority,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            payload: Some(payload),
        }
    }

    #[tokio::test]
    async fn test_enqueue_upserts_pending_item() {
        let pool = setup().await;
        let repo = SqliteSyncQueueRepository::new(pool.clone());
        let entity_id = Uuid::new_v4();

        repo.enqueue(&new_item(entity_id, PRIORITY_NORMAL, json!({"rev": 1})))
            .await
            .unwrap();
        let second = repo
            .enqueue(&new_item(entity_id, 2, json!({"rev": 2})))
            .await
            .unwrap();

        let total: i64 = query_scalar("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(second.priority, 2);
        assert_eq!(second.payload, Some(json!({"rev": 2})));
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_schedule() {
        let pool = setup().await;
        let repo = SqliteSyncQueueRepository::new(pool);

        let low = repo
            .enqueue(&new_item(Uuid::new_v4(), 8, json!({})))
            .await
            .unwrap();
        let urgent = repo
            .enqueue(&new_item(Uuid::new_v4(), 1, json!({})))
            .await
            .unwrap();

        let claimed = repo.claim_due(10, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, urgent.id);
        assert_eq!(claimed[1].id, low.id);
        assert!(claimed.iter().all(|i| i.status == SyncQueueStatus::Syncing));

        // Claimed items are not claimable again
        assert!(repo.claim_due(10, Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_ceiling_transitions_to_failed() {
        let pool = setup().await;
        let repo = SqliteSyncQueueRepository::new(pool);

        let item = repo
            .enqueue(&new_item(Uuid::new_v4(), PRIORITY_NORMAL, json!({})))
            .await
            .unwrap();

        for attempt in 1..=DEFAULT_MAX_ATTEMPTS {
            let claimed = repo.claim_due(10, Utc::now()).await.unwrap();
            assert_eq!(claimed.len(), 1, "attempt {} should claim the item", attempt);
            let status = repo
                .record_failed_attempt(item.id, "boom", Utc::now())
                .await
                .unwrap();
            if attempt < DEFAULT_MAX_ATTEMPTS {
                assert_eq!(status, SyncQueueStatus::Error);
            } else {
                assert_eq!(status, SyncQueueStatus::Failed);
            }
        }

        // Terminal: a further tick never selects it
        assert!(repo.claim_due(10, Utc::now()).await.unwrap().is_empty());
        let reloaded = repo.find_by_id(item.id).await.unwrap();
        assert_eq!(reloaded.status, SyncQueueStatus::Failed);
        assert_eq!(reloaded.attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_log_purge_respects_horizon() {
        let pool = setup().await;
        let repo = SqliteSyncLogRepository::new(pool);

        let item = SyncQueueItem {
            id: Uuid::new_v4(),
            entity_type: EntityKind::Projects,
            entity_id: Uuid::new_v4(),
            action: ChangeAction::Update,
            target_service: "crm".to_string(),
            priority: PRIORITY_NORMAL,
            status: SyncQueueStatus::Syncing,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            payload: None,
            scheduled_at: Utc::now(),
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let mut old_entry = SyncLogEntry::outbound_success(&item, json!({"ok": true}), 12);
        old_entry.timestamp = Utc::now() - chrono::Duration::days(45);
        repo.record(&old_entry).await.unwrap();

        let fresh_entry = SyncLogEntry::outbound_success(&item, json!({"ok": true}), 9);
        repo.record(&fresh_entry).await.unwrap();

        let purged = repo
            .purge_before(Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        let remaining = repo
            .query_entries(&SyncLogFilter::default(), PaginationParams::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, fresh_entry.id);
    }

    #[tokio::test]
    async fn test_conflict_resolve_is_single_shot() {
        let pool = setup().await;
        let repo = SqliteConflictRepository::new(pool);
        let user_id = Uuid::new_v4();

        let conflict = SyncConflict::new(
            EntityKind::TimeEntries,
            Uuid::new_v4(),
            json!({"description": "client"}),
            Utc::now(),
            json!({"description": "server"}),
            user_id,
        );
        repo.create(&conflict).await.unwrap();

        assert_eq!(repo.list_pending_for_user(user_id).await.unwrap().len(), 1);

        repo.mark_resolved(conflict.id, ConflictResolution::Server, Utc::now())
            .await
            .unwrap();

        assert!(repo.list_pending_for_user(user_id).await.unwrap().is_empty());
        let again = repo
            .mark_resolved(conflict.id, ConflictResolution::Client, Utc::now())
            .await;
        assert!(matches!(
            again,
            Err(DomainError::Sync(SyncError::AlreadyResolved(_)))
        ));
    }
}
