use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::errors::{DomainError, DomainResult, SyncError};

/// The fixed set of business entities eligible for offline mutation.
///
/// Adding an entity type means implementing an `EntityAdapter` and registering
/// it; nothing in the sync core switches on entity names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Projects,
    TimeEntries,
    InventoryItems,
    Expenses,
    Tasks,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Projects => "projects",
            EntityKind::TimeEntries => "time_entries",
            EntityKind::InventoryItems => "inventory_items",
            EntityKind::Expenses => "expenses",
            EntityKind::Tasks => "tasks",
        }
    }

    pub fn all() -> [EntityKind; 5] {
        [
            EntityKind::Projects,
            EntityKind::TimeEntries,
            EntityKind::InventoryItems,
            EntityKind::Expenses,
            EntityKind::Tasks,
        ]
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "projects" => Ok(EntityKind::Projects),
            "time_entries" => Ok(EntityKind::TimeEntries),
            "inventory_items" => Ok(EntityKind::InventoryItems),
            "expenses" => Ok(EntityKind::Expenses),
            "tasks" => Ok(EntityKind::Tasks),
            _ => Err(DomainError::Sync(SyncError::UnknownEntityType(
                s.to_string(),
            ))),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of mutation applied to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "create",
            ChangeAction::Update => "update",
            ChangeAction::Delete => "delete",
        }
    }
}

impl FromStr for ChangeAction {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ChangeAction::Create),
            "update" => Ok(ChangeAction::Update),
            "delete" => Ok(ChangeAction::Delete),
            _ => Err(DomainError::Sync(SyncError::UnsupportedAction(
                s.to_string(),
            ))),
        }
    }
}

/// A full entity row as it crosses the adapter boundary.
///
/// `data` is the serialized row (including its soft-delete marker where the
/// entity has one); `sync_version` and `updated_at` are lifted out so the sync
/// core can run version comparisons without knowing the row shape.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: Uuid,
    pub sync_version: i64,
    pub updated_at: DateTime<Utc>,
    pub data: JsonValue,
}

/// How a delete request was honored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    SoftDeleted,
    HardDeleted,
}

/// Uniform store access for one entity type.
///
/// Implementations own the SQL for their table; the sync core only ever talks
/// to this trait. Payloads are whitelist-filtered: authorship and version
/// columns never pass through `data`.
#[async_trait]
pub trait EntityAdapter: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Declared capability; never derived from schema introspection.
    fn supports_soft_delete(&self) -> bool;

    /// Fetch a live row. Soft-deleted rows are treated as absent.
    async fn get(&self, id: Uuid) -> DomainResult<EntityRecord>;

    /// Insert a new row with a server-generated id.
    async fn insert(&self, data: &JsonValue, auth: &AuthContext) -> DomainResult<EntityRecord>;

    /// Apply whitelisted fields from `data`, bumping sync_version.
    async fn update(
        &self,
        id: Uuid,
        data: &JsonValue,
        auth: &AuthContext,
    ) -> DomainResult<EntityRecord>;

    /// Soft delete when supported, hard delete otherwise.
    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<DeleteOutcome>;

    /// Rows changed after `since` that `user_id` is allowed to see.
    /// Includes soft-deleted rows so deletion markers propagate.
    async fn changed_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> DomainResult<Vec<EntityRecord>>;
}

/// Registry of entity adapters resolved by typed kind
pub struct EntityRegistry {
    adapters: HashMap<EntityKind, Arc<dyn EntityAdapter>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn EntityAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: EntityKind) -> DomainResult<Arc<dyn EntityAdapter>> {
        self.adapters.get(&kind).cloned().ok_or_else(|| {
            DomainError::Sync(SyncError::UnknownEntityType(kind.as_str().to_string()))
        })
    }

    /// Registered kinds in declaration order
    pub fn kinds(&self) -> Vec<EntityKind> {
        EntityKind::all()
            .into_iter()
            .filter(|k| self.adapters.contains_key(k))
            .collect()
    }
}

impl Default for EntityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fired after every applied entity mutation. Consumers decide whether the
/// change needs further propagation (e.g. enqueueing outbound delivery).
/// Hook failures must never fail the mutation that triggered them.
#[async_trait]
pub trait EntityChangeHook: Send + Sync {
    async fn entity_changed(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        action: ChangeAction,
        data: &JsonValue,
        auth: &AuthContext,
    );
}

/// Ordered collection of change hooks
#[derive(Default)]
pub struct ChangeHooks {
    hooks: Vec<Arc<dyn EntityChangeHook>>,
}

impl ChangeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: Arc<dyn EntityChangeHook>) {
        self.hooks.push(hook);
    }

    pub async fn fire(
        &self,
        kind: EntityKind,
        entity_id: Uuid,
        action: ChangeAction,
        data: &JsonValue,
        auth: &AuthContext,
    ) {
        for hook in &self.hooks {
            hook.entity_changed(kind, entity_id, action, data, auth).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_codec() {
        for kind in EntityKind::all() {
            assert_eq!(EntityKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(EntityKind::from_str("donors").is_err());
    }

    #[test]
    fn test_change_action_codec() {
        for action in [
            ChangeAction::Create,
            ChangeAction::Update,
            ChangeAction::Delete,
        ] {
            assert_eq!(ChangeAction::from_str(action.as_str()).unwrap(), action);
        }
        assert!(ChangeAction::from_str("upsert").is_err());
    }

    #[test]
    fn test_registry_rejects_unregistered_kind() {
        let registry = EntityRegistry::new();
        assert!(registry.get(EntityKind::Projects).is_err());
        assert!(registry.kinds().is_empty());
    }
}
