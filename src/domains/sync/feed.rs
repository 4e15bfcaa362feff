use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::domains::core::{ChangeAction, EntityRegistry};
use crate::domains::sync::repository::TombstoneRepository;
use crate::domains::sync::types::ChangeRecord;
use crate::errors::DomainResult;

/// Computes the set of server-side changes relevant to a device since its
/// last checkpoint: full rows the user may see, plus tombstones for hard
/// deletions. Soft deletions travel as ordinary updates carrying their
/// `deleted_at` marker.
pub struct ServerChangeFeed {
    registry: Arc<EntityRegistry>,
    tombstones: Arc<dyn TombstoneRepository>,
}

impl ServerChangeFeed {
    pub fn new(registry: Arc<EntityRegistry>, tombstones: Arc<dyn TombstoneRepository>) -> Self {
        Self {
            registry,
            tombstones,
        }
    }

    pub async fn changes_since(
        &self,
        user_id: Uuid,
        checkpoint: DateTime<Utc>,
    ) -> DomainResult<Vec<ChangeRecord>> {
        let mut changes = Vec::new();

        for kind in self.registry.kinds() {
            let adapter = self.registry.get(kind)?;
            for record in adapter.changed_since(user_id, checkpoint).await? {
                changes.push(ChangeRecord {
                    entity_type: record.kind,
                    entity_id: record.id,
                    action: ChangeAction::Update,
                    data: Some(record.data),
                });
            }
        }

        for tombstone in self.tombstones.find_since(checkpoint).await? {
            changes.push(ChangeRecord {
                entity_type: tombstone.entity_type,
                entity_id: tombstone.entity_id,
                action: ChangeAction::Delete,
                data: None,
            });
        }

        Ok(changes)
    }
}
