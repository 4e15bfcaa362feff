use chrono::Utc;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::EntityRegistry;
use crate::domains::sync::repository::ConflictRepository;
use crate::domains::sync::types::{ConflictResolution, ConflictStatus, SyncConflict};
use crate::errors::{DomainError, ServiceError, ServiceResult, SyncError, ValidationError};

/// Applies one of three resolution policies to a recorded conflict.
///
/// Reads are idempotent; resolve is not. Callers must check a conflict's
/// status before resolving it again.
pub struct ConflictResolver {
    conflicts: Arc<dyn ConflictRepository>,
    registry: Arc<EntityRegistry>,
}

impl ConflictResolver {
    pub fn new(conflicts: Arc<dyn ConflictRepository>, registry: Arc<EntityRegistry>) -> Self {
        Self {
            conflicts,
            registry,
        }
    }

    /// Pending conflicts owned by the calling user
    pub async fn list_pending(&self, auth: &AuthContext) -> ServiceResult<Vec<SyncConflict>> {
        Ok(self.conflicts.list_pending_for_user(auth.user_id).await?)
    }

    /// Resolve a conflict. Only the user who authored the losing edit, or an
    /// administrator, may resolve it.
    pub async fn resolve(
        &self,
        conflict_id: Uuid,
        resolution: ConflictResolution,
        merged_data: Option<JsonValue>,
        auth: &AuthContext,
    ) -> ServiceResult<()> {
        let conflict = self.conflicts.find_by_id(conflict_id).await?;

        if conflict.status == ConflictStatus::Resolved {
            return Err(DomainError::Sync(SyncError::AlreadyResolved(conflict_id)).into());
        }
        auth.authorize_self_or_admin(&conflict.user_id)?;

        match resolution {
            ConflictResolution::Client => {
                // Re-apply the stored client edit over the current server
                // state; this is a fresh write, so the row version moves
                // forward rather than rolling back.
                let adapter = self.registry.get(conflict.entity_type)?;
                adapter
                    .update(conflict.entity_id, &conflict.client_data, auth)
                    .await?;
            }
            ConflictResolution::Server => {
                // The server row already reflects the winner
            }
            ConflictResolution::Merge => {
                let merged = merged_data.ok_or_else(|| {
                    ServiceError::Domain(DomainError::Validation(ValidationError::required(
                        "merged_data",
                    )))
                })?;
                let adapter = self.registry.get(conflict.entity_type)?;
                adapter.update(conflict.entity_id, &merged, auth).await?;
            }
        }

        self.conflicts
            .mark_resolved(conflict_id, resolution, Utc::now())
            .await?;

        log::info!(
            "Conflict {} on {} {} resolved as {}",
            conflict_id,
            conflict.entity_type,
            conflict.entity_id,
            resolution.as_str()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::{EntityAdapter, EntityKind};
    use crate::domains::entities::SqliteTimeEntryAdapter;
    use crate::domains::sync::repository::SqliteConflictRepository;
    use crate::types::UserRole;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    struct Fixture {
        resolver: ConflictResolver,
        conflicts: Arc<SqliteConflictRepository>,
        adapter: Arc<SqliteTimeEntryAdapter>,
        auth: AuthContext,
    }

    async fn setup() -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        crate::db_migration::run_migrations(&pool).await.expect("migrations");

        let adapter = Arc::new(SqliteTimeEntryAdapter::new(pool.clone()));
        let mut registry = EntityRegistry::new();
        registry.register(adapter.clone());

        let conflicts = Arc::new(SqliteConflictRepository::new(pool));
        let resolver = ConflictResolver::new(conflicts.clone(), Arc::new(registry));
        let auth = AuthContext::new(Uuid::new_v4(), UserRole::FieldOfficer, None);

        Fixture {
            resolver,
            conflicts,
            adapter,
            auth,
        }
    }

    async fn seed_conflict(fx: &Fixture) -> (Uuid, SyncConflict) {
        let created = fx
            .adapter
            .insert(
                &json!({"started_at": "2026-03-01T08:00:00Z", "description": "server state"}),
                &fx.auth,
            )
            .await
            .unwrap();

        let conflict = SyncConflict::new(
            EntityKind::TimeEntries,
            created.id,
            json!({"description": "client edit"}),
            Utc::now(),
            created.data.clone(),
            fx.auth.user_id,
        );
        fx.conflicts.create(&conflict).await.unwrap();
        (created.id, conflict)
    }

    #[tokio::test]
    async fn test_client_wins_reapplies_client_data() {
        let fx = setup().await;
        let (entity_id, conflict) = seed_conflict(&fx).await;

        fx.resolver
            .resolve(conflict.id, ConflictResolution::Client, None, &fx.auth)
            .await
            .unwrap();

        let stored = fx.adapter.get(entity_id).await.unwrap();
        assert_eq!(stored.data["description"], json!("client edit"));
        assert!(fx.resolver.list_pending(&fx.auth).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_wins_leaves_row_unchanged() {
        let fx = setup().await;
        let (entity_id, conflict) = seed_conflict(&fx).await;
        let before = fx.adapter.get(entity_id).await.unwrap();

        fx.resolver
            .resolve(conflict.id, ConflictResolution::Server, None, &fx.auth)
            .await
            .unwrap();

        let after = fx.adapter.get(entity_id).await.unwrap();
        assert_eq!(after.data, before.data);
        assert_eq!(after.sync_version, before.sync_version);
    }

    #[tokio::test]
    async fn test_merge_applies_caller_payload() {
        let fx = setup().await;
        let (entity_id, conflict) = seed_conflict(&fx).await;

        fx.resolver
            .resolve(
                conflict.id,
                ConflictResolution::Merge,
                Some(json!({"description": "merged text"})),
                &fx.auth,
            )
            .await
            .unwrap();

        let stored = fx.adapter.get(entity_id).await.unwrap();
        assert_eq!(stored.data["description"], json!("merged text"));
    }

    #[tokio::test]
    async fn test_merge_without_payload_is_rejected() {
        let fx = setup().await;
        let (_, conflict) = seed_conflict(&fx).await;

        let result = fx
            .resolver
            .resolve(conflict.id, ConflictResolution::Merge, None, &fx.auth)
            .await;
        assert!(result.is_err());

        // Still pending after the failed resolve
        assert_eq!(fx.resolver.list_pending(&fx.auth).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_double_resolve_is_an_error() {
        let fx = setup().await;
        let (_, conflict) = seed_conflict(&fx).await;

        fx.resolver
            .resolve(conflict.id, ConflictResolution::Server, None, &fx.auth)
            .await
            .unwrap();

        let again = fx
            .resolver
            .resolve(conflict.id, ConflictResolution::Client, None, &fx.auth)
            .await;
        assert!(matches!(
            again,
            Err(ServiceError::Domain(DomainError::Sync(
                SyncError::AlreadyResolved(_)
            )))
        ));
    }

    #[tokio::test]
    async fn test_other_user_cannot_resolve() {
        let fx = setup().await;
        let (_, conflict) = seed_conflict(&fx).await;

        let stranger = AuthContext::new(Uuid::new_v4(), UserRole::FieldOfficer, None);
        let result = fx
            .resolver
            .resolve(conflict.id, ConflictResolution::Server, None, &stranger)
            .await;
        assert!(matches!(result, Err(ServiceError::PermissionDenied(_))));

        // An administrator may resolve on the user's behalf
        let admin = AuthContext::new(Uuid::new_v4(), UserRole::Admin, None);
        fx.resolver
            .resolve(conflict.id, ConflictResolution::Server, None, &admin)
            .await
            .unwrap();
    }
}
