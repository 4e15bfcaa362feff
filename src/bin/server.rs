use std::sync::Arc;

use fieldops_core::api::config::AppConfig;
use fieldops_core::api::routes::{app_router, AppState};
use fieldops_core::database;
use fieldops_core::db_migration;
use fieldops_core::domains::core::{ChangeHooks, EntityRegistry};
use fieldops_core::domains::entities::{
    SqliteExpenseAdapter, SqliteInventoryAdapter, SqliteProjectAdapter, SqliteTaskAdapter,
    SqliteTimeEntryAdapter,
};
use fieldops_core::domains::sync::delivery::{DeliveryRegistry, HttpDeliveryAdapter};
use fieldops_core::domains::sync::feed::ServerChangeFeed;
use fieldops_core::domains::sync::processor::OfflineMutationProcessor;
use fieldops_core::domains::sync::repository::{
    SqliteConflictRepository, SqliteSyncLogRepository, SqliteSyncQueueRepository,
    SqliteTombstoneRepository,
};
use fieldops_core::domains::sync::resolver::ConflictResolver;
use fieldops_core::domains::sync::service::{OutboundEnqueueHook, OutboundSyncService};
use fieldops_core::domains::sync::types::PRIORITY_NORMAL;
use fieldops_core::domains::sync::worker::{spawn_retention_task, SyncWorker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenv::dotenv().ok();

    env_logger::init();

    let config = AppConfig::from_env()?;
    log::info!("Starting fieldops-server");

    let pool = database::connect(&config.database_url).await?;
    db_migration::run_migrations(&pool).await?;

    // Entity store adapters, one registration per syncable entity type
    let mut registry = EntityRegistry::new();
    registry.register(Arc::new(SqliteProjectAdapter::new(pool.clone())));
    registry.register(Arc::new(SqliteTimeEntryAdapter::new(pool.clone())));
    registry.register(Arc::new(SqliteInventoryAdapter::new(pool.clone())));
    registry.register(Arc::new(SqliteExpenseAdapter::new(pool.clone())));
    registry.register(Arc::new(SqliteTaskAdapter::new(pool.clone())));
    let registry = Arc::new(registry);

    // Sync stores
    let queue_repo = Arc::new(SqliteSyncQueueRepository::new(pool.clone()));
    let log_repo = Arc::new(SqliteSyncLogRepository::new(pool.clone()));
    let conflict_repo = Arc::new(SqliteConflictRepository::new(pool.clone()));
    let tombstone_repo = Arc::new(SqliteTombstoneRepository::new(pool.clone()));

    // Outbound delivery adapters from configuration
    let mut deliveries = DeliveryRegistry::new();
    for (service, endpoint) in &config.delivery_targets {
        log::info!("Registering delivery adapter {} -> {}", service, endpoint);
        deliveries.register(Arc::new(HttpDeliveryAdapter::new(
            service,
            endpoint,
            config.worker.delivery_timeout,
        )));
    }

    // Queue worker and its control channel
    let worker = SyncWorker::new(
        queue_repo.clone(),
        log_repo.clone(),
        Arc::new(deliveries),
        config.worker.clone(),
    );
    let (_worker_task, worker_handle) = worker.start();

    let mut outbound = OutboundSyncService::new(
        queue_repo.clone(),
        log_repo.clone(),
        Some(config.queue_max_attempts),
    );
    outbound.set_worker_handle(worker_handle);
    let outbound = Arc::new(outbound);

    // Entity change hooks: mutations fan out into the outbound queue
    let mut hooks = ChangeHooks::new();
    hooks.register(Arc::new(OutboundEnqueueHook::new(
        outbound.clone(),
        config.outbound_routes.clone(),
        PRIORITY_NORMAL,
    )));
    let hooks = Arc::new(hooks);

    let feed = Arc::new(ServerChangeFeed::new(
        registry.clone(),
        tombstone_repo.clone(),
    ));
    let processor = Arc::new(OfflineMutationProcessor::new(
        registry.clone(),
        conflict_repo.clone(),
        tombstone_repo,
        hooks,
        feed,
    ));
    let resolver = Arc::new(ConflictResolver::new(conflict_repo, registry.clone()));

    let _retention_task = spawn_retention_task(
        log_repo,
        config.log_retention_days,
        config.retention_check_interval,
    );

    let state = AppState {
        processor,
        resolver,
        outbound,
        registry,
    };
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    log::info!("fieldops-server listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
