use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::{ChangeAction, EntityChangeHook, EntityKind};
use crate::domains::sync::repository::{SyncLogRepository, SyncQueueRepository};
use crate::domains::sync::types::{
    NewQueueItem, SyncLogEntry, SyncLogFilter, SyncQueueItem, SyncQueueStatus, SyncStatusReport,
    DEFAULT_MAX_ATTEMPTS, PRIORITY_IMMEDIATE,
};
use crate::domains::sync::worker::WorkerMessage;
use crate::errors::ServiceResult;
use crate::types::PaginationParams;

/// Window over which per-service error counts are reported
const HEALTH_ERROR_WINDOW_HOURS: i64 = 24;

/// Front door of the outbound sync queue: enqueueing, manual triggers and
/// the operator status surface. Draining is the worker's job.
pub struct OutboundSyncService {
    queue: Arc<dyn SyncQueueRepository>,
    log: Arc<dyn SyncLogRepository>,
    worker: Option<mpsc::Sender<WorkerMessage>>,
    max_attempts: i64,
}

impl OutboundSyncService {
    pub fn new(
        queue: Arc<dyn SyncQueueRepository>,
        log: Arc<dyn SyncLogRepository>,
        max_attempts: Option<i64>,
    ) -> Self {
        Self {
            queue,
            log,
            worker: None,
            max_attempts: max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
        }
    }

    /// Wire the running worker's control channel so manual triggers can kick
    /// an immediate tick. Must happen before the service is shared.
    pub fn set_worker_handle(&mut self, handle: mpsc::Sender<WorkerMessage>) {
        self.worker = Some(handle);
    }

    /// Enqueue propagation work for an entity mutation
    pub async fn enqueue_change(
        &self,
        entity_type: EntityKind,
        entity_id: Uuid,
        action: ChangeAction,
        target_service: &str,
        priority: i64,
        payload: Option<JsonValue>,
    ) -> ServiceResult<SyncQueueItem> {
        let item = self
            .queue
            .enqueue(&NewQueueItem {
                entity_type,
                entity_id,
                action,
                target_service: target_service.to_string(),
                priority,
                max_attempts: self.max_attempts,
                payload,
            })
            .await?;

        log::debug!(
            "Queued {} {} {} for {} (priority {})",
            action.as_str(),
            entity_type,
            entity_id,
            target_service,
            priority
        );
        Ok(item)
    }

    /// Manually trigger propagation for one entity at top priority and kick
    /// the worker instead of waiting for its schedule.
    pub async fn trigger_sync(
        &self,
        entity_type: EntityKind,
        entity_id: Uuid,
        target_service: &str,
        auth: &AuthContext,
    ) -> ServiceResult<SyncQueueItem> {
        auth.authorize_operator()?;

        let item = self
            .enqueue_change(
                entity_type,
                entity_id,
                ChangeAction::Update,
                target_service,
                PRIORITY_IMMEDIATE,
                None,
            )
            .await?;

        if let Some(worker) = &self.worker {
            let (response, _receiver) = oneshot::channel();
            if worker
                .try_send(WorkerMessage::ProcessNow { response })
                .is_err()
            {
                log::warn!("Sync worker channel full or closed; trigger will wait for the schedule");
            }
        }

        Ok(item)
    }

    /// Operator-facing queue overview
    pub async fn status(&self, auth: &AuthContext) -> ServiceResult<SyncStatusReport> {
        auth.authorize_operator()?;

        let counts = self.queue.status_counts().await?;
        let count = |status: SyncQueueStatus| counts.get(&status).copied().unwrap_or(0);

        let window_start = Utc::now() - ChronoDuration::hours(HEALTH_ERROR_WINDOW_HOURS);
        let services = self.log.service_health(window_start).await?;

        Ok(SyncStatusReport {
            pending: count(SyncQueueStatus::Pending),
            syncing: count(SyncQueueStatus::Syncing),
            retrying: count(SyncQueueStatus::Error),
            synced: count(SyncQueueStatus::Synced),
            failed: count(SyncQueueStatus::Failed),
            last_synced_at: self.queue.last_synced_at().await?,
            services,
        })
    }

    /// Observability query over the delivery audit log
    pub async fn query_log(
        &self,
        filter: &SyncLogFilter,
        params: PaginationParams,
        auth: &AuthContext,
    ) -> ServiceResult<Vec<SyncLogEntry>> {
        auth.authorize_operator()?;
        Ok(self.log.query_entries(filter, params).await?)
    }
}

/// Change hook that enqueues outbound propagation for entity kinds routed to
/// external services. Enqueue failures are logged, never surfaced to the
/// mutation that fired the hook.
pub struct OutboundEnqueueHook {
    service: Arc<OutboundSyncService>,
    routes: HashMap<EntityKind, Vec<String>>,
    priority: i64,
}

impl OutboundEnqueueHook {
    pub fn new(
        service: Arc<OutboundSyncService>,
        routes: HashMap<EntityKind, Vec<String>>,
        priority: i64,
    ) -> Self {
        Self {
            service,
            routes,
            priority,
        }
    }
}

#[async_trait]
impl EntityChangeHook for OutboundEnqueueHook {
    async fn entity_changed(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        action: ChangeAction,
        data: &JsonValue,
        _auth: &AuthContext,
    ) {
        let Some(targets) = self.routes.get(&kind) else {
            return;
        };

        let payload = if data.is_null() {
            None
        } else {
            Some(data.clone())
        };

        for target in targets {
            if let Err(e) = self
                .service
                .enqueue_change(kind, entity_id, action, target, self.priority, payload.clone())
                .await
            {
                log::error!(
                    "Failed to enqueue {} {} for {}: {}",
                    kind,
                    entity_id,
                    target,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::sync::repository::{
        SqliteSyncLogRepository, SqliteSyncQueueRepository,
    };
    use crate::types::UserRole;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (Arc<OutboundSyncService>, AuthContext) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        crate::db_migration::run_migrations(&pool).await.expect("migrations");

        let queue = Arc::new(SqliteSyncQueueRepository::new(pool.clone()));
        let log = Arc::new(SqliteSyncLogRepository::new(pool));
        let service = Arc::new(OutboundSyncService::new(queue, log, None));
        let auth = AuthContext::new(Uuid::new_v4(), UserRole::Admin, None);
        (service, auth)
    }

    #[tokio::test]
    async fn test_trigger_sync_enqueues_at_top_priority() {
        let (service, auth) = setup().await;

        let item = service
            .trigger_sync(EntityKind::Projects, Uuid::new_v4(), "crm", &auth)
            .await
            .unwrap();

        assert_eq!(item.priority, PRIORITY_IMMEDIATE);
        assert_eq!(item.status, SyncQueueStatus::Pending);
    }

    #[tokio::test]
    async fn test_trigger_sync_requires_operator() {
        let (service, _) = setup().await;
        let officer = AuthContext::new(Uuid::new_v4(), UserRole::FieldOfficer, None);

        let result = service
            .trigger_sync(EntityKind::Projects, Uuid::new_v4(), "crm", &officer)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_status_reports_queue_counts() {
        let (service, auth) = setup().await;

        service
            .enqueue_change(
                EntityKind::InventoryItems,
                Uuid::new_v4(),
                ChangeAction::Update,
                "erp",
                5,
                Some(json!({"quantity": 3})),
            )
            .await
            .unwrap();

        let report = service.status(&auth).await.unwrap();
        assert_eq!(report.pending, 1);
        assert_eq!(report.failed, 0);
        assert!(report.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn test_hook_routes_only_mapped_kinds() {
        let (service, auth) = setup().await;

        let mut routes = HashMap::new();
        routes.insert(EntityKind::Projects, vec!["crm".to_string()]);
        let hook = OutboundEnqueueHook::new(service.clone(), routes, 5);

        hook.entity_changed(
            EntityKind::Projects,
            Uuid::new_v4(),
            ChangeAction::Create,
            &json!({"name": "Depot refit"}),
            &auth,
        )
        .await;
        hook.entity_changed(
            EntityKind::TimeEntries,
            Uuid::new_v4(),
            ChangeAction::Create,
            &json!({"description": "not routed"}),
            &auth,
        )
        .await;

        let report = service.status(&auth).await.unwrap();
        assert_eq!(report.pending, 1);
    }
}
