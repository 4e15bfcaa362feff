use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use crate::domains::sync::delivery::DeliveryRegistry;
use crate::domains::sync::repository::{SyncLogRepository, SyncQueueRepository};
use crate::domains::sync::types::{SyncLogEntry, SyncQueueItem, SyncQueueStatus};
use crate::errors::{DomainError, ServiceError, ServiceResult, SyncError};

/// Messages that can be sent to the sync worker for real-time control
#[derive(Debug)]
pub enum WorkerMessage {
    /// Run a tick immediately instead of waiting for the schedule.
    /// Responds with the number of items claimed.
    ProcessNow {
        response: oneshot::Sender<ServiceResult<usize>>,
    },
    /// Stop the worker loop
    Shutdown { response: oneshot::Sender<()> },
}

/// Tuning for the queue worker
#[derive(Debug, Clone)]
pub struct SyncWorkerConfig {
    pub poll_interval: Duration,
    /// Items claimed per tick
    pub batch_size: u32,
    /// Hard ceiling on one delivery call; a timed-out call counts as a
    /// retryable error, not a terminal failure
    pub delivery_timeout: Duration,
    pub max_concurrent_deliveries: usize,
    /// Base delay before a retryable item is re-selected, scaled by attempts
    pub retry_base_delay: Duration,
    /// Random extra delay added on top of each retry's backoff
    pub retry_jitter: Duration,
}

impl Default for SyncWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 25,
            delivery_timeout: Duration::from_secs(30),
            max_concurrent_deliveries: 3,
            retry_base_delay: Duration::from_secs(60),
            retry_jitter: Duration::from_secs(15),
        }
    }
}

/// Periodic worker draining the outbound sync queue against the registered
/// delivery adapters, writing one audit log entry per attempt.
pub struct SyncWorker {
    queue: Arc<dyn SyncQueueRepository>,
    log: Arc<dyn SyncLogRepository>,
    deliveries: Arc<DeliveryRegistry>,
    config: SyncWorkerConfig,
    semaphore: Arc<Semaphore>,
    receiver: mpsc::Receiver<WorkerMessage>,
    sender: mpsc::Sender<WorkerMessage>,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<dyn SyncQueueRepository>,
        log: Arc<dyn SyncLogRepository>,
        deliveries: Arc<DeliveryRegistry>,
        config: SyncWorkerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1)));

        Self {
            queue,
            log,
            deliveries,
            config,
            semaphore,
            receiver,
            sender,
        }
    }

    /// Control channel for manual triggers and shutdown
    pub fn handle(&self) -> mpsc::Sender<WorkerMessage> {
        self.sender.clone()
    }

    /// Spawn the worker loop
    pub fn start(self) -> (JoinHandle<()>, mpsc::Sender<WorkerMessage>) {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            self.run().await;
        });
        (handle, sender)
    }

    async fn run(mut self) {
        log::info!(
            "Sync worker started (poll {:?}, batch {})",
            self.config.poll_interval,
            self.config.batch_size
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        log::error!("Sync worker tick failed: {}", e);
                    }
                }
                message = self.receiver.recv() => {
                    match message {
                        Some(WorkerMessage::ProcessNow { response }) => {
                            let result = self.tick().await;
                            let _ = response.send(result);
                        }
                        Some(WorkerMessage::Shutdown { response }) => {
                            let _ = response.send(());
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        log::info!("Sync worker stopped");
    }

    /// One drain pass: claim due items and deliver them concurrently under
    /// the delivery semaphore. Item failures never abort the tick.
    pub async fn tick(&self) -> ServiceResult<usize> {
        let claimed = self
            .queue
            .claim_due(self.config.batch_size, Utc::now())
            .await?;
        if claimed.is_empty() {
            return Ok(0);
        }

        let count = claimed.len();
        log::debug!("Sync worker claimed {} item(s)", count);

        join_all(claimed.into_iter().map(|item| self.process_item(item))).await;

        Ok(count)
    }

    async fn process_item(&self, item: SyncQueueItem) {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let started = Instant::now();
        let outcome: ServiceResult<JsonValue> = match self.deliveries.get(&item.target_service) {
            None => Err(ServiceError::Domain(DomainError::Sync(
                SyncError::UnknownTargetService(item.target_service.clone()),
            ))),
            Some(adapter) => {
                match timeout(self.config.delivery_timeout, adapter.deliver(&item)).await {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Domain(DomainError::Sync(
                        SyncError::DeliveryTimeout,
                    ))),
                }
            }
        };
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(response) => {
                let entry = SyncLogEntry::outbound_success(&item, response, duration_ms);
                if let Err(e) = self.log.record(&entry).await {
                    log::error!("Failed to record sync log entry for {}: {}", item.id, e);
                }
                if let Err(e) = self.queue.mark_synced(item.id).await {
                    log::error!("Failed to mark queue item {} synced: {}", item.id, e);
                } else {
                    log::info!(
                        "Delivered {} {} to {} in {}ms",
                        item.entity_type,
                        item.entity_id,
                        item.target_service,
                        duration_ms
                    );
                }
            }
            Err(error) => {
                let message = error.to_string();
                let entry = SyncLogEntry::outbound_error(&item, &message, duration_ms);
                if let Err(e) = self.log.record(&entry).await {
                    log::error!("Failed to record sync log entry for {}: {}", item.id, e);
                }

                let retry_at = self.retry_at(&item);
                match self
                    .queue
                    .record_failed_attempt(item.id, &message, retry_at)
                    .await
                {
                    Ok(SyncQueueStatus::Failed) => log::error!(
                        "Queue item {} ({} {}) failed permanently after {} attempts: {}",
                        item.id,
                        item.entity_type,
                        item.entity_id,
                        item.attempts + 1,
                        message
                    ),
                    Ok(_) => log::warn!(
                        "Delivery of {} to {} failed (attempt {}), retrying at {}: {}",
                        item.entity_id,
                        item.target_service,
                        item.attempts + 1,
                        retry_at,
                        message
                    ),
                    Err(e) => log::error!(
                        "Failed to record attempt for queue item {}: {}",
                        item.id,
                        e
                    ),
                }
            }
        }
    }

    fn retry_at(&self, item: &SyncQueueItem) -> DateTime<Utc> {
        let backoff = self.config.retry_base_delay * (item.attempts as u32 + 1);
        let jitter_ms = self.config.retry_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };

        Utc::now()
            + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(60))
            + chrono::Duration::milliseconds(jitter as i64)
    }
}

/// Periodic retention pass over the delivery audit log. Housekeeping only;
/// sync correctness never depends on it.
pub fn spawn_retention_task(
    log: Arc<dyn SyncLogRepository>,
    retention_days: i64,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::days(retention_days);
            match log.purge_before(cutoff).await {
                Ok(0) => {}
                Ok(purged) => log::info!(
                    "Purged {} sync log entries older than {} days",
                    purged,
                    retention_days
                ),
                Err(e) => log::error!("Sync log purge failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::{ChangeAction, EntityKind};
    use crate::domains::sync::delivery::DeliveryAdapter;
    use crate::domains::sync::repository::{
        SqliteSyncLogRepository, SqliteSyncQueueRepository,
    };
    use crate::domains::sync::types::{NewQueueItem, SyncDirection, SyncLogFilter, SyncLogStatus};
    use crate::types::PaginationParams;
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    struct StubDeliveryAdapter {
        service: String,
        fail: AtomicBool,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl StubDeliveryAdapter {
        fn new(service: &str) -> Self {
            Self {
                service: service.to_string(),
                fail: AtomicBool::new(false),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DeliveryAdapter for StubDeliveryAdapter {
        fn service_name(&self) -> &str {
            &self.service
        }

        async fn deliver(&self, _item: &SyncQueueItem) -> ServiceResult<JsonValue> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(ServiceError::ExternalService("stub failure".to_string()))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    struct Fixture {
        queue: Arc<SqliteSyncQueueRepository>,
        log: Arc<SqliteSyncLogRepository>,
        stub: Arc<StubDeliveryAdapter>,
        worker: SyncWorker,
    }

    async fn setup(stub: StubDeliveryAdapter, config: SyncWorkerConfig) -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        crate::db_migration::run_migrations(&pool).await.expect("migrations");

        let queue = Arc::new(SqliteSyncQueueRepository::new(pool.clone()));
        let log = Arc::new(SqliteSyncLogRepository::new(pool));

        let stub = Arc::new(stub);
        let mut deliveries = DeliveryRegistry::new();
        deliveries.register(stub.clone());

        let worker = SyncWorker::new(
            queue.clone(),
            log.clone(),
            Arc::new(deliveries),
            config,
        );

        Fixture {
            queue,
            log,
            stub,
            worker,
        }
    }

    fn immediate_retry_config() -> SyncWorkerConfig {
        SyncWorkerConfig {
            poll_interval: Duration::from_secs(3600),
            retry_base_delay: Duration::ZERO,
            retry_jitter: Duration::ZERO,
            ..SyncWorkerConfig::default()
        }
    }

    fn enqueue_request(entity_id: Uuid, service: &str) -> NewQueueItem {
        NewQueueItem {
            entity_type: EntityKind::Projects,
            entity_id,
            action: ChangeAction::Update,
            target_service: service.to_string(),
            priority: 5,
            max_attempts: 3,
            payload: Some(json!({"name": "Depot refit"})),
        }
    }

    #[tokio::test]
    async fn test_successful_delivery_logs_and_settles() {
        let fx = setup(StubDeliveryAdapter::new("crm"), immediate_retry_config()).await;

        let item = fx
            .queue
            .enqueue(&enqueue_request(Uuid::new_v4(), "crm"))
            .await
            .unwrap();

        let processed = fx.worker.tick().await.unwrap();
        assert_eq!(processed, 1);
        assert_eq!(fx.stub.calls.load(Ordering::SeqCst), 1);

        let settled = fx.queue.find_by_id(item.id).await.unwrap();
        assert_eq!(settled.status, SyncQueueStatus::Synced);
        assert!(settled.processed_at.is_some());

        let entries = fx
            .log
            .query_entries(&SyncLogFilter::default(), PaginationParams::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, SyncLogStatus::Success);
        assert_eq!(entries[0].direction, SyncDirection::Outbound);
        assert!(entries[0].duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_become_terminal_failure() {
        let stub = StubDeliveryAdapter::new("crm");
        stub.fail.store(true, Ordering::SeqCst);
        let fx = setup(stub, immediate_retry_config()).await;

        let item = fx
            .queue
            .enqueue(&enqueue_request(Uuid::new_v4(), "crm"))
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(fx.worker.tick().await.unwrap(), 1);
        }

        let settled = fx.queue.find_by_id(item.id).await.unwrap();
        assert_eq!(settled.status, SyncQueueStatus::Failed);
        assert_eq!(settled.attempts, 3);

        // A fourth tick must not select the failed item
        assert_eq!(fx.worker.tick().await.unwrap(), 0);
        assert_eq!(fx.stub.calls.load(Ordering::SeqCst), 3);

        let entries = fx
            .log
            .query_entries(&SyncLogFilter::default(), PaginationParams::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.status == SyncLogStatus::Error));
    }

    #[tokio::test]
    async fn test_unknown_target_service_counts_as_attempt() {
        let fx = setup(StubDeliveryAdapter::new("crm"), immediate_retry_config()).await;

        let item = fx
            .queue
            .enqueue(&enqueue_request(Uuid::new_v4(), "not-registered"))
            .await
            .unwrap();

        fx.worker.tick().await.unwrap();

        let after = fx.queue.find_by_id(item.id).await.unwrap();
        assert_eq!(after.status, SyncQueueStatus::Error);
        assert_eq!(after.attempts, 1);
        assert!(after.last_error.is_some());
        assert_eq!(fx.stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timed_out_delivery_is_retryable() {
        let mut stub = StubDeliveryAdapter::new("crm");
        stub.delay = Some(Duration::from_millis(250));
        let mut config = immediate_retry_config();
        config.delivery_timeout = Duration::from_millis(25);
        let fx = setup(stub, config).await;

        let item = fx
            .queue
            .enqueue(&enqueue_request(Uuid::new_v4(), "crm"))
            .await
            .unwrap();

        fx.worker.tick().await.unwrap();

        let after = fx.queue.find_by_id(item.id).await.unwrap();
        assert_eq!(after.status, SyncQueueStatus::Error);
        assert_eq!(after.attempts, 1);
    }

    #[tokio::test]
    async fn test_process_now_message_runs_a_tick() {
        let fx = setup(StubDeliveryAdapter::new("crm"), immediate_retry_config()).await;
        let queue = fx.queue.clone();
        let stub = fx.stub.clone();

        queue
            .enqueue(&enqueue_request(Uuid::new_v4(), "crm"))
            .await
            .unwrap();

        let (join, sender) = fx.worker.start();

        let (response, receiver) = oneshot::channel();
        sender
            .send(WorkerMessage::ProcessNow { response })
            .await
            .unwrap();
        // The startup tick may have drained the item already; the manual
        // tick must still respond either way.
        receiver.await.unwrap().unwrap();
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        let (response, receiver) = oneshot::channel();
        sender
            .send(WorkerMessage::Shutdown { response })
            .await
            .unwrap();
        receiver.await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_purges_old_entries() {
        let fx = setup(StubDeliveryAdapter::new("crm"), immediate_retry_config()).await;

        let item = SyncQueueItem {
            id: Uuid::new_v4(),
            entity_type: EntityKind::Projects,
            entity_id: Uuid::new_v4(),
            action: ChangeAction::Update,
            target_service: "crm".to_string(),
            priority: 5,
            status: SyncQueueStatus::Syncing,
            attempts: 0,
            max_attempts: 3,
            last_error: None,
            payload: None,
            scheduled_at: Utc::now(),
            processed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let mut stale = SyncLogEntry::outbound_success(&item, json!({}), 5);
        stale.timestamp = Utc::now() - chrono::Duration::days(90);
        fx.log.record(&stale).await.unwrap();

        let task = spawn_retention_task(fx.log.clone(), 30, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        let remaining = fx
            .log
            .query_entries(&SyncLogFilter::default(), PaginationParams::default())
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }
}
