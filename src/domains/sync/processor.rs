use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::{
    ChangeAction, ChangeHooks, DeleteOutcome, EntityKind, EntityRegistry,
};
use crate::domains::sync::feed::ServerChangeFeed;
use crate::domains::sync::repository::{ConflictRepository, TombstoneRepository};
use crate::domains::sync::types::{
    BatchResults, MutationConflict, MutationError, OfflineMutation, ProcessedMutation,
    SyncConflict, SyncRequest, SyncResponse, Tombstone,
};
use crate::errors::{DomainError, DomainResult, ServiceResult, SyncError, ValidationError};

/// Fields a client may echo back but must never write through the adapter
const CLIENT_ONLY_FIELDS: &[&str] = &[
    "id",
    "client_id",
    "sync_version",
    "user_id",
    "created_at",
    "updated_at",
    "created_by_user_id",
    "updated_by_user_id",
    "deleted_at",
    "deleted_by_user_id",
];

enum ItemOutcome {
    Processed(ProcessedMutation),
    Conflict(MutationConflict),
}

/// Applies batches of client-originated mutations, detecting conflicts via
/// version comparison and recording them instead of applying.
///
/// One bad item never aborts the rest of the batch.
pub struct OfflineMutationProcessor {
    registry: Arc<EntityRegistry>,
    conflicts: Arc<dyn ConflictRepository>,
    tombstones: Arc<dyn TombstoneRepository>,
    hooks: Arc<ChangeHooks>,
    feed: Arc<ServerChangeFeed>,
}

impl OfflineMutationProcessor {
    pub fn new(
        registry: Arc<EntityRegistry>,
        conflicts: Arc<dyn ConflictRepository>,
        tombstones: Arc<dyn TombstoneRepository>,
        hooks: Arc<ChangeHooks>,
        feed: Arc<ServerChangeFeed>,
    ) -> Self {
        Self {
            registry,
            conflicts,
            tombstones,
            hooks,
            feed,
        }
    }

    /// Process a device's mutation batch and compute its delta pull.
    ///
    /// The response's `server_time` is the checkpoint the client should keep
    /// once it has persisted the response.
    pub async fn process_batch(
        &self,
        auth: &AuthContext,
        request: SyncRequest,
    ) -> ServiceResult<SyncResponse> {
        let mut results = BatchResults::default();

        for mutation in &request.mutations {
            match self.process_one(auth, mutation).await {
                Ok(ItemOutcome::Processed(processed)) => results.processed.push(processed),
                Ok(ItemOutcome::Conflict(conflict)) => results.conflicts.push(conflict),
                Err(e) => {
                    log::warn!(
                        "Mutation {} ({} {}) rejected: {}",
                        mutation.client_id,
                        mutation.action,
                        mutation.entity_type,
                        e
                    );
                    results.errors.push(MutationError {
                        client_id: mutation.client_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let checkpoint = DateTime::from_timestamp(request.last_sync.max(0), 0)
            .unwrap_or(DateTime::UNIX_EPOCH);
        let server_changes = self.feed.changes_since(auth.user_id, checkpoint).await?;

        Ok(SyncResponse {
            success: true,
            results,
            server_changes,
            server_time: Utc::now().timestamp(),
        })
    }

    async fn process_one(
        &self,
        auth: &AuthContext,
        mutation: &OfflineMutation,
    ) -> DomainResult<ItemOutcome> {
        let kind = EntityKind::from_str(&mutation.entity_type)?;
        let action = ChangeAction::from_str(&mutation.action)?;
        let adapter = self.registry.get(kind)?;

        match action {
            ChangeAction::Create => {
                let data = sanitized(&mutation.data)?;
                let record = adapter.insert(&data, auth).await?;
                self.hooks
                    .fire(kind, record.id, ChangeAction::Create, &record.data, auth)
                    .await;
                Ok(ItemOutcome::Processed(ProcessedMutation {
                    client_id: mutation.client_id.clone(),
                    entity_type: kind,
                    server_id: record.id,
                    action,
                }))
            }
            ChangeAction::Update => {
                let entity_id = required_entity_id(&mutation.data)?;
                let current = adapter.get(entity_id).await?;

                if is_stale(mutation, current.sync_version, current.updated_at)? {
                    let conflict = SyncConflict::new(
                        kind,
                        entity_id,
                        mutation.data.clone(),
                        client_time(mutation),
                        current.data.clone(),
                        auth.user_id,
                    );
                    self.conflicts.create(&conflict).await?;
                    return Ok(ItemOutcome::Conflict(MutationConflict {
                        client_id: mutation.client_id.clone(),
                        conflict_id: conflict.id,
                        entity_type: kind,
                        entity_id,
                        server_data: current.data,
                    }));
                }

                let data = sanitized(&mutation.data)?;
                let record = adapter.update(entity_id, &data, auth).await?;
                self.hooks
                    .fire(kind, entity_id, ChangeAction::Update, &record.data, auth)
                    .await;
                Ok(ItemOutcome::Processed(ProcessedMutation {
                    client_id: mutation.client_id.clone(),
                    entity_type: kind,
                    server_id: entity_id,
                    action,
                }))
            }
            ChangeAction::Delete => {
                let entity_id = required_entity_id(&mutation.data)?;
                let outcome = adapter.delete(entity_id, auth).await?;

                if outcome == DeleteOutcome::HardDeleted {
                    self.tombstones
                        .create(&Tombstone::new(kind, entity_id, auth.user_id))
                        .await?;
                }

                self.hooks
                    .fire(kind, entity_id, ChangeAction::Delete, &JsonValue::Null, auth)
                    .await;
                Ok(ItemOutcome::Processed(ProcessedMutation {
                    client_id: mutation.client_id.clone(),
                    entity_type: kind,
                    server_id: entity_id,
                    action,
                }))
            }
        }
    }
}

/// A mutation is stale when the server row moved past the client's base.
/// The payload's `sync_version` is authoritative; the mutation timestamp is
/// the fallback for clients that never saw a version.
fn is_stale(
    mutation: &OfflineMutation,
    server_version: i64,
    server_updated_at: DateTime<Utc>,
) -> DomainResult<bool> {
    if let Some(client_version) = mutation.data.get("sync_version").and_then(JsonValue::as_i64) {
        return Ok(server_version > client_version);
    }
    if let Some(ts) = mutation.timestamp {
        let client_time =
            DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::UNIX_EPOCH);
        return Ok(server_updated_at > client_time);
    }
    Err(DomainError::Sync(SyncError::MissingVersion))
}

fn client_time(mutation: &OfflineMutation) -> DateTime<Utc> {
    mutation
        .timestamp
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now)
}

fn required_entity_id(data: &JsonValue) -> DomainResult<Uuid> {
    let raw = data
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or(DomainError::Sync(SyncError::MissingEntityId))?;
    Uuid::parse_str(raw).map_err(|_| DomainError::InvalidUuid(raw.to_string()))
}

/// Strip client-only fields before the payload crosses the adapter boundary
fn sanitized(data: &JsonValue) -> DomainResult<JsonValue> {
    let mut map = data
        .as_object()
        .ok_or_else(|| {
            DomainError::Validation(ValidationError::entity("mutation data must be an object"))
        })?
        .clone();
    for field in CLIENT_ONLY_FIELDS {
        map.remove(*field);
    }
    Ok(JsonValue::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::EntityChangeHook;
    use crate::domains::entities::{
        SqliteInventoryAdapter, SqliteProjectAdapter, SqliteTaskAdapter, SqliteTimeEntryAdapter,
    };
    use crate::domains::sync::repository::{
        SqliteConflictRepository, SqliteTombstoneRepository,
    };
    use crate::types::UserRole;
    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHook {
        fired: AtomicUsize,
    }

    #[async_trait]
    impl EntityChangeHook for CountingHook {
        async fn entity_changed(
            &self,
            _kind: EntityKind,
            _entity_id: Uuid,
            _action: ChangeAction,
            _data: &JsonValue,
            _auth: &AuthContext,
        ) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        processor: OfflineMutationProcessor,
        conflicts: Arc<SqliteConflictRepository>,
        registry: Arc<EntityRegistry>,
        hook: Arc<CountingHook>,
        auth: AuthContext,
    }

    async fn setup() -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        crate::db_migration::run_migrations(&pool).await.expect("migrations");

        let mut registry = EntityRegistry::new();
        registry.register(Arc::new(SqliteProjectAdapter::new(pool.clone())));
        registry.register(Arc::new(SqliteTimeEntryAdapter::new(pool.clone())));
        registry.register(Arc::new(SqliteInventoryAdapter::new(pool.clone())));
        registry.register(Arc::new(SqliteTaskAdapter::new(pool.clone())));
        let registry = Arc::new(registry);

        let conflicts = Arc::new(SqliteConflictRepository::new(pool.clone()));
        let tombstones = Arc::new(SqliteTombstoneRepository::new(pool.clone()));

        let hook = Arc::new(CountingHook {
            fired: AtomicUsize::new(0),
        });
        let mut hooks = ChangeHooks::new();
        hooks.register(hook.clone());

        let feed = Arc::new(ServerChangeFeed::new(registry.clone(), tombstones.clone()));
        let processor = OfflineMutationProcessor::new(
            registry.clone(),
            conflicts.clone(),
            tombstones,
            Arc::new(hooks),
            feed,
        );

        let auth = AuthContext::new(Uuid::new_v4(), UserRole::FieldOfficer, None);

        Fixture {
            processor,
            conflicts,
            registry,
            hook,
            auth,
        }
    }

    fn mutation(
        entity_type: &str,
        action: &str,
        data: JsonValue,
        client_id: &str,
        timestamp: Option<i64>,
    ) -> OfflineMutation {
        OfflineMutation {
            entity_type: entity_type.to_string(),
            action: action.to_string(),
            data,
            client_id: client_id.to_string(),
            timestamp,
        }
    }

    #[tokio::test]
    async fn test_create_returns_server_id_keyed_by_client_id() {
        let fx = setup().await;

        let response = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![mutation(
                        "time_entries",
                        "create",
                        json!({"started_at": "2026-03-01T08:00:00Z", "description": "Formwork"}),
                        "local-1",
                        Some(1_767_250_000),
                    )],
                    last_sync: 0,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.results.processed.len(), 1);
        let processed = &response.results.processed[0];
        assert_eq!(processed.client_id, "local-1");

        let adapter = fx.registry.get(EntityKind::TimeEntries).unwrap();
        let stored = adapter.get(processed.server_id).await.unwrap();
        assert_eq!(stored.data["description"], json!("Formwork"));
        assert_eq!(fx.hook.fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_update_records_conflict_and_leaves_row_unchanged() {
        let fx = setup().await;
        let adapter = fx.registry.get(EntityKind::TimeEntries).unwrap();

        let created = adapter
            .insert(
                &json!({"started_at": "2026-03-01T08:00:00Z", "description": "original"}),
                &fx.auth,
            )
            .await
            .unwrap();
        // Another device already moved the row forward
        adapter
            .update(created.id, &json!({"description": "server wins"}), &fx.auth)
            .await
            .unwrap();

        let response = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![mutation(
                        "time_entries",
                        "update",
                        json!({
                            "id": created.id.to_string(),
                            "sync_version": 0,
                            "description": "stale client edit"
                        }),
                        "local-2",
                        None,
                    )],
                    last_sync: 0,
                },
            )
            .await
            .unwrap();

        assert!(response.results.processed.is_empty());
        assert_eq!(response.results.conflicts.len(), 1);
        let conflict = &response.results.conflicts[0];
        assert_eq!(conflict.client_id, "local-2");
        assert_eq!(conflict.server_data["description"], json!("server wins"));

        let stored = adapter.get(created.id).await.unwrap();
        assert_eq!(stored.data["description"], json!("server wins"));
        assert_eq!(stored.sync_version, 1);

        let pending = fx
            .conflicts
            .list_pending_for_user(fx.auth.user_id)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, created.id);
    }

    #[tokio::test]
    async fn test_timestamp_fallback_conflict() {
        let fx = setup().await;
        let adapter = fx.registry.get(EntityKind::TimeEntries).unwrap();

        let created = adapter
            .insert(&json!({"started_at": "2026-03-01T08:00:00Z"}), &fx.auth)
            .await
            .unwrap();

        // Client edit stamped long before the server row's updated_at
        let response = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![mutation(
                        "time_entries",
                        "update",
                        json!({"id": created.id.to_string(), "description": "late edit"}),
                        "local-3",
                        Some(100),
                    )],
                    last_sync: 0,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.results.conflicts.len(), 1);
        let stored = adapter.get(created.id).await.unwrap();
        assert_eq!(stored.data["description"], JsonValue::Null);
    }

    #[tokio::test]
    async fn test_current_version_update_applies_and_bumps() {
        let fx = setup().await;
        let adapter = fx.registry.get(EntityKind::TimeEntries).unwrap();

        let created = adapter
            .insert(&json!({"started_at": "2026-03-01T08:00:00Z"}), &fx.auth)
            .await
            .unwrap();

        let response = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![mutation(
                        "time_entries",
                        "update",
                        json!({
                            "id": created.id.to_string(),
                            "sync_version": 0,
                            "description": "fresh edit"
                        }),
                        "local-4",
                        None,
                    )],
                    last_sync: 0,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.results.processed.len(), 1);
        let stored = adapter.get(created.id).await.unwrap();
        assert_eq!(stored.data["description"], json!("fresh edit"));
        assert_eq!(stored.sync_version, 1);
    }

    #[tokio::test]
    async fn test_bad_item_does_not_abort_batch() {
        let fx = setup().await;

        let response = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![
                        mutation("voice_notes", "create", json!({}), "bad-1", None),
                        mutation(
                            "tasks",
                            "create",
                            json!({"title": "Pour footing"}),
                            "good-1",
                            None,
                        ),
                        mutation("tasks", "archive", json!({}), "bad-2", None),
                    ],
                    last_sync: 0,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.results.processed.len(), 1);
        assert_eq!(response.results.errors.len(), 2);
        assert_eq!(response.results.processed[0].client_id, "good-1");
    }

    #[tokio::test]
    async fn test_hard_delete_writes_tombstone_visible_in_feed() {
        let fx = setup().await;
        let adapter = fx.registry.get(EntityKind::Tasks).unwrap();

        let created = adapter
            .insert(&json!({"title": "Strip forms"}), &fx.auth)
            .await
            .unwrap();

        let response = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![mutation(
                        "tasks",
                        "delete",
                        json!({"id": created.id.to_string()}),
                        "local-5",
                        None,
                    )],
                    last_sync: 0,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.results.processed.len(), 1);
        let deletions: Vec<_> = response
            .server_changes
            .iter()
            .filter(|c| c.action == ChangeAction::Delete)
            .collect();
        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].entity_id, created.id);
        assert!(deletions[0].data.is_none());
    }

    #[tokio::test]
    async fn test_feed_empty_at_server_time() {
        let fx = setup().await;
        let adapter = fx.registry.get(EntityKind::InventoryItems).unwrap();
        adapter
            .insert(&json!({"name": "Anchor bolts", "quantity": 200}), &fx.auth)
            .await
            .unwrap();

        // Cross the checkpoint's second-granularity boundary before syncing
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let first = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![],
                    last_sync: 0,
                },
            )
            .await
            .unwrap();
        assert!(!first.server_changes.is_empty());

        // Re-sync from the returned checkpoint with a quiet server
        let second = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![],
                    last_sync: first.server_time,
                },
            )
            .await
            .unwrap();
        assert!(second.server_changes.is_empty());
    }

    #[tokio::test]
    async fn test_update_requires_server_id() {
        let fx = setup().await;

        let response = fx
            .processor
            .process_batch(
                &fx.auth,
                SyncRequest {
                    mutations: vec![mutation(
                        "time_entries",
                        "update",
                        json!({"description": "no id"}),
                        "local-6",
                        Some(100),
                    )],
                    last_sync: 0,
                },
            )
            .await
            .unwrap();

        assert_eq!(response.results.errors.len(), 1);
    }
}
