use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::domains::core::{ChangeAction, EntityKind};
use crate::errors::{DomainError, ValidationError};
use crate::utils::{parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid};

/// Highest queue priority, used by manual triggers
pub const PRIORITY_IMMEDIATE: i64 = 1;

/// Default queue priority for hook-driven enqueues
pub const PRIORITY_NORMAL: i64 = 5;

/// Default delivery attempt ceiling
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// The lifecycle status of an outbound queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncQueueStatus {
    Pending,
    Syncing,
    Synced,
    Error,
    Failed,
}

impl SyncQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncQueueStatus::Pending => "pending",
            SyncQueueStatus::Syncing => "syncing",
            SyncQueueStatus::Synced => "synced",
            SyncQueueStatus::Error => "error",
            SyncQueueStatus::Failed => "failed",
        }
    }

    /// Terminal statuses are never picked up by the worker again
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncQueueStatus::Synced | SyncQueueStatus::Failed)
    }
}

impl FromStr for SyncQueueStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncQueueStatus::Pending),
            "syncing" => Ok(SyncQueueStatus::Syncing),
            "synced" => Ok(SyncQueueStatus::Synced),
            "error" => Ok(SyncQueueStatus::Error),
            "failed" => Ok(SyncQueueStatus::Failed),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid SyncQueueStatus string: {}",
                s
            )))),
        }
    }
}

/// The direction of a sync operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Inbound,
    Outbound,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Inbound => "inbound",
            SyncDirection::Outbound => "outbound",
        }
    }
}

impl FromStr for SyncDirection {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(SyncDirection::Inbound),
            "outbound" => Ok(SyncDirection::Outbound),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid SyncDirection string: {}",
                s
            )))),
        }
    }
}

/// Outcome of a single delivery attempt, as recorded in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLogStatus {
    Success,
    Error,
}

impl SyncLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncLogStatus::Success => "success",
            SyncLogStatus::Error => "error",
        }
    }
}

impl FromStr for SyncLogStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncLogStatus::Success),
            "error" => Ok(SyncLogStatus::Error),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid SyncLogStatus string: {}",
                s
            )))),
        }
    }
}

/// The status of a recorded conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for ConflictStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConflictStatus::Pending),
            "resolved" => Ok(ConflictStatus::Resolved),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid ConflictStatus string: {}",
                s
            )))),
        }
    }
}

/// Resolution policy applied to a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Client,
    Server,
    Merge,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Client => "client",
            ConflictResolution::Server => "server",
            ConflictResolution::Merge => "merge",
        }
    }
}

impl FromStr for ConflictResolution {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(ConflictResolution::Client),
            "server" => Ok(ConflictResolution::Server),
            "merge" => Ok(ConflictResolution::Merge),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid ConflictResolution string: {}",
                s
            )))),
        }
    }
}

/// One unit of outbound propagation work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: Uuid,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub action: ChangeAction,
    pub target_service: String,
    pub priority: i64,
    pub status: SyncQueueStatus,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub payload: Option<JsonValue>,
    pub scheduled_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Enqueue request for the outbound queue
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub action: ChangeAction,
    pub target_service: String,
    pub priority: i64,
    pub max_attempts: i64,
    pub payload: Option<JsonValue>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncQueueItemRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub target_service: String,
    pub priority: i64,
    pub status: String,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub payload: Option<String>,
    pub scheduled_at: String,
    pub processed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SyncQueueItemRow> for SyncQueueItem {
    type Error = DomainError;
    fn try_from(row: SyncQueueItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "sync_queue.id")?,
            entity_type: EntityKind::from_str(&row.entity_type)?,
            entity_id: parse_uuid(&row.entity_id, "sync_queue.entity_id")?,
            action: ChangeAction::from_str(&row.action)?,
            target_service: row.target_service,
            priority: row.priority,
            status: SyncQueueStatus::from_str(&row.status)?,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            last_error: row.last_error,
            payload: parse_opt_json(row.payload, "sync_queue.payload")?,
            scheduled_at: parse_ts(&row.scheduled_at, "sync_queue.scheduled_at")?,
            processed_at: parse_opt_ts(row.processed_at, "sync_queue.processed_at")?,
            created_at: parse_ts(&row.created_at, "sync_queue.created_at")?,
            updated_at: parse_ts(&row.updated_at, "sync_queue.updated_at")?,
        })
    }
}

/// Immutable audit record of one delivery attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub direction: SyncDirection,
    pub target_service: String,
    pub action: String,
    pub status: SyncLogStatus,
    pub request_snapshot: Option<JsonValue>,
    pub response_snapshot: Option<JsonValue>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

impl SyncLogEntry {
    /// Log record for a successful outbound delivery
    pub fn outbound_success(item: &SyncQueueItem, response: JsonValue, duration_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: item.entity_type.as_str().to_string(),
            entity_id: item.entity_id,
            direction: SyncDirection::Outbound,
            target_service: item.target_service.clone(),
            action: item.action.as_str().to_string(),
            status: SyncLogStatus::Success,
            request_snapshot: item.payload.clone(),
            response_snapshot: Some(response),
            error_message: None,
            duration_ms: Some(duration_ms),
            timestamp: Utc::now(),
        }
    }

    /// Log record for a failed outbound delivery attempt
    pub fn outbound_error(item: &SyncQueueItem, error: &str, duration_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: item.entity_type.as_str().to_string(),
            entity_id: item.entity_id,
            direction: SyncDirection::Outbound,
            target_service: item.target_service.clone(),
            action: item.action.as_str().to_string(),
            status: SyncLogStatus::Error,
            request_snapshot: item.payload.clone(),
            response_snapshot: None,
            error_message: Some(error.to_string()),
            duration_ms: Some(duration_ms),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncLogEntryRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub direction: String,
    pub target_service: String,
    pub action: String,
    pub status: String,
    pub request_snapshot: Option<String>,
    pub response_snapshot: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: String,
}

impl TryFrom<SyncLogEntryRow> for SyncLogEntry {
    type Error = DomainError;
    fn try_from(row: SyncLogEntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "sync_log.id")?,
            entity_type: row.entity_type,
            entity_id: parse_uuid(&row.entity_id, "sync_log.entity_id")?,
            direction: SyncDirection::from_str(&row.direction)?,
            target_service: row.target_service,
            action: row.action,
            status: SyncLogStatus::from_str(&row.status)?,
            request_snapshot: parse_opt_json(row.request_snapshot, "sync_log.request_snapshot")?,
            response_snapshot: parse_opt_json(row.response_snapshot, "sync_log.response_snapshot")?,
            error_message: row.error_message,
            duration_ms: row.duration_ms,
            timestamp: parse_ts(&row.timestamp, "sync_log.timestamp")?,
        })
    }
}

/// Filters for the observability log query
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncLogFilter {
    pub entity_type: Option<String>,
    pub target_service: Option<String>,
    pub status: Option<SyncLogStatus>,
}

/// A contested record: the client's losing edit paired with the server
/// snapshot taken at detection time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: Uuid,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub client_data: JsonValue,
    pub client_time: DateTime<Utc>,
    pub server_data: JsonValue,
    pub user_id: Uuid,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl SyncConflict {
    pub fn new(
        entity_type: EntityKind,
        entity_id: Uuid,
        client_data: JsonValue,
        client_time: DateTime<Utc>,
        server_data: JsonValue,
        user_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            entity_id,
            client_data,
            client_time,
            server_data,
            user_id,
            status: ConflictStatus::Pending,
            resolution: None,
            resolved_at: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncConflictRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub client_data: String,
    pub client_time: String,
    pub server_data: String,
    pub user_id: String,
    pub status: String,
    pub resolution: Option<String>,
    pub resolved_at: Option<String>,
    pub created_at: String,
}

impl TryFrom<SyncConflictRow> for SyncConflict {
    type Error = DomainError;
    fn try_from(row: SyncConflictRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "sync_conflicts.id")?,
            entity_type: EntityKind::from_str(&row.entity_type)?,
            entity_id: parse_uuid(&row.entity_id, "sync_conflicts.entity_id")?,
            client_data: parse_json(&row.client_data, "sync_conflicts.client_data")?,
            client_time: parse_ts(&row.client_time, "sync_conflicts.client_time")?,
            server_data: parse_json(&row.server_data, "sync_conflicts.server_data")?,
            user_id: parse_uuid(&row.user_id, "sync_conflicts.user_id")?,
            status: ConflictStatus::from_str(&row.status)?,
            resolution: row
                .resolution
                .map(|s| ConflictResolution::from_str(&s))
                .transpose()?,
            resolved_at: parse_opt_ts(row.resolved_at, "sync_conflicts.resolved_at")?,
            created_at: parse_ts(&row.created_at, "sync_conflicts.created_at")?,
        })
    }
}

/// Record of a hard-deleted entity, surfaced through the change feed so
/// other devices learn about deletions they did not originate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: Uuid,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub deleted_by: Option<Uuid>,
    pub deleted_at: DateTime<Utc>,
}

impl Tombstone {
    pub fn new(entity_type: EntityKind, entity_id: Uuid, deleted_by: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            entity_id,
            deleted_by: Some(deleted_by),
            deleted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct TombstoneRow {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub deleted_by: Option<String>,
    pub deleted_at: String,
}

impl TryFrom<TombstoneRow> for Tombstone {
    type Error = DomainError;
    fn try_from(row: TombstoneRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id, "tombstones.id")?,
            entity_type: EntityKind::from_str(&row.entity_type)?,
            entity_id: parse_uuid(&row.entity_id, "tombstones.entity_id")?,
            deleted_by: parse_opt_uuid(row.deleted_by, "tombstones.deleted_by")?,
            deleted_at: parse_ts(&row.deleted_at, "tombstones.deleted_at")?,
        })
    }
}

/// A client-originated mutation, as received on the wire.
/// `client_id` is a correlation token generated by the device, never a
/// server identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineMutation {
    pub entity_type: String,
    pub action: String,
    #[serde(default)]
    pub data: JsonValue,
    pub client_id: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Batch sync request body
#[derive(Debug, Clone, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub mutations: Vec<OfflineMutation>,
    /// Client checkpoint, epoch seconds; 0 means "everything"
    #[serde(default)]
    pub last_sync: i64,
}

/// Successful per-item outcome
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedMutation {
    pub client_id: String,
    pub entity_type: EntityKind,
    pub server_id: Uuid,
    pub action: ChangeAction,
}

/// Per-item conflict outcome
#[derive(Debug, Clone, Serialize)]
pub struct MutationConflict {
    pub client_id: String,
    pub conflict_id: Uuid,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub server_data: JsonValue,
}

/// Per-item failure outcome
#[derive(Debug, Clone, Serialize)]
pub struct MutationError {
    pub client_id: String,
    pub error: String,
}

/// Per-item outcomes of a mutation batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResults {
    pub processed: Vec<ProcessedMutation>,
    pub conflicts: Vec<MutationConflict>,
    pub errors: Vec<MutationError>,
}

/// One entry in the server change feed
#[derive(Debug, Clone, Serialize)]
pub struct ChangeRecord {
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub action: ChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// Batch sync response body
#[derive(Debug, Clone, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub results: BatchResults,
    pub server_changes: Vec<ChangeRecord>,
    /// Epoch seconds; the client stores this as its next checkpoint only
    /// after persisting the response.
    pub server_time: i64,
}

/// Client cache hints in the manifest
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub max_age: u64,
    pub stale_while_revalidate: u64,
}

/// Per-entity capability advertised to offline clients
#[derive(Debug, Clone, Serialize)]
pub struct EntityCapability {
    pub entity_type: EntityKind,
    pub supports_soft_delete: bool,
}

/// Manifest describing what an offline client is allowed to sync
#[derive(Debug, Clone, Serialize)]
pub struct SyncManifest {
    pub version: String,
    pub server_time: i64,
    pub user_id: Uuid,
    pub capabilities: Vec<String>,
    pub endpoints: JsonValue,
    pub cache_config: CacheConfig,
    pub entities: Vec<EntityCapability>,
}

/// Per-target-service delivery health
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ServiceHealthRow {
    pub target_service: String,
    pub last_success_at: Option<String>,
    pub recent_errors: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub target_service: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub recent_errors: i64,
}

impl TryFrom<ServiceHealthRow> for ServiceHealth {
    type Error = DomainError;
    fn try_from(row: ServiceHealthRow) -> Result<Self, Self::Error> {
        Ok(Self {
            target_service: row.target_service,
            last_success_at: parse_opt_ts(row.last_success_at, "sync_log.timestamp")?,
            recent_errors: row.recent_errors,
        })
    }
}

/// Operator-facing queue overview
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatusReport {
    pub pending: i64,
    pub syncing: i64,
    pub retrying: i64,
    pub synced: i64,
    pub failed: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub services: Vec<ServiceHealth>,
}

fn parse_json(raw: &str, field_name: &str) -> Result<JsonValue, DomainError> {
    serde_json::from_str(raw).map_err(|e| {
        DomainError::Validation(ValidationError::format(
            field_name,
            &format!("Invalid JSON: {}", e),
        ))
    })
}

fn parse_opt_json(raw: Option<String>, field_name: &str) -> Result<Option<JsonValue>, DomainError> {
    raw.map(|s| parse_json(&s, field_name)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_codec() {
        for status in [
            SyncQueueStatus::Pending,
            SyncQueueStatus::Syncing,
            SyncQueueStatus::Synced,
            SyncQueueStatus::Error,
            SyncQueueStatus::Failed,
        ] {
            assert_eq!(SyncQueueStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(SyncQueueStatus::from_str("done").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SyncQueueStatus::Synced.is_terminal());
        assert!(SyncQueueStatus::Failed.is_terminal());
        assert!(!SyncQueueStatus::Error.is_terminal());
        assert!(!SyncQueueStatus::Pending.is_terminal());
    }

    #[test]
    fn test_sync_request_defaults() {
        let req: SyncRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.last_sync, 0);
        assert!(req.mutations.is_empty());
    }

    #[test]
    fn test_resolution_codec() {
        for r in [
            ConflictResolution::Client,
            ConflictResolution::Server,
            ConflictResolution::Merge,
        ] {
            assert_eq!(ConflictResolution::from_str(r.as_str()).unwrap(), r);
        }
        assert!(ConflictResolution::from_str("theirs").is_err());
    }
}
