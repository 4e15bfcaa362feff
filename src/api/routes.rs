use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::api::error::AppError;
use crate::auth::AuthContext;
use crate::domains::core::{EntityKind, EntityRegistry};
use crate::domains::sync::processor::OfflineMutationProcessor;
use crate::domains::sync::resolver::ConflictResolver;
use crate::domains::sync::service::OutboundSyncService;
use crate::domains::sync::types::{
    CacheConfig, ConflictResolution, EntityCapability, SyncConflict, SyncLogEntry, SyncLogFilter,
    SyncLogStatus, SyncManifest, SyncRequest, SyncResponse, SyncStatusReport,
};
use crate::types::{PaginationParams, UserRole};

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<OfflineMutationProcessor>,
    pub resolver: Arc<ConflictResolver>,
    pub outbound: Arc<OutboundSyncService>,
    pub registry: Arc<EntityRegistry>,
}

pub fn app_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/sync", post(process_sync_batch))
        .route("/sync/manifest", get(sync_manifest))
        .route("/sync/conflicts", get(list_conflicts))
        .route("/sync/conflicts/{id}/resolve", post(resolve_conflict))
        .route("/sync/status", get(sync_status))
        .route("/sync/trigger", post(trigger_sync))
        .route("/sync/log", get(query_sync_log))
        .route_layer(middleware::from_fn(require_identity));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api/v1", sync_routes)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

/// Builds the per-request identity from trusted gateway headers.
/// Authentication itself happens upstream; this surface only consumes the
/// resulting user identity.
async fn require_identity(mut request: Request, next: Next) -> Result<Response, AppError> {
    let headers = request.headers();

    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("Missing X-User-Id header"))?;
    let user_id = Uuid::parse_str(user_id)
        .map_err(|_| AppError::unauthorized("Invalid X-User-Id header"))?;

    let role = match headers.get("x-user-role").and_then(|v| v.to_str().ok()) {
        Some(raw) => UserRole::from_str(raw)
            .map_err(|_| AppError::bad_request(format!("Unknown role: {}", raw)))?,
        None => UserRole::FieldOfficer,
    };

    let device_id = headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    request
        .extensions_mut()
        .insert(AuthContext::new(user_id, role, device_id));
    Ok(next.run(request).await)
}

async fn process_sync_batch(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    let response = state.processor.process_batch(&auth, request).await?;
    Ok(Json(response))
}

async fn sync_manifest(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<SyncManifest>, AppError> {
    let mut entities = Vec::new();
    for kind in state.registry.kinds() {
        let adapter = state.registry.get(kind).map_err(AppError::from)?;
        entities.push(EntityCapability {
            entity_type: kind,
            supports_soft_delete: adapter.supports_soft_delete(),
        });
    }

    Ok(Json(SyncManifest {
        version: env!("CARGO_PKG_VERSION").to_string(),
        server_time: Utc::now().timestamp(),
        user_id: auth.user_id,
        capabilities: vec![
            "offline_mutations".to_string(),
            "delta_pull".to_string(),
            "conflict_resolution".to_string(),
            "outbound_queue".to_string(),
        ],
        endpoints: json!({
            "sync": "/api/v1/sync",
            "manifest": "/api/v1/sync/manifest",
            "conflicts": "/api/v1/sync/conflicts",
            "resolve": "/api/v1/sync/conflicts/{id}/resolve",
            "status": "/api/v1/sync/status",
            "trigger": "/api/v1/sync/trigger",
            "log": "/api/v1/sync/log",
        }),
        cache_config: CacheConfig {
            max_age: 300,
            stale_while_revalidate: 3600,
        },
        entities,
    }))
}

async fn list_conflicts(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<SyncConflict>>, AppError> {
    let conflicts = state.resolver.list_pending(&auth).await?;
    Ok(Json(conflicts))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    resolution: String,
    #[serde(default)]
    merged_data: Option<JsonValue>,
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(conflict_id): Path<Uuid>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<JsonValue>, AppError> {
    let resolution = ConflictResolution::from_str(&body.resolution)
        .map_err(|_| AppError::bad_request(format!("Unknown resolution: {}", body.resolution)))?;

    state
        .resolver
        .resolve(conflict_id, resolution, body.merged_data, &auth)
        .await?;

    Ok(Json(json!({
        "success": true,
        "conflict_id": conflict_id,
        "resolution": resolution,
    })))
}

async fn sync_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<SyncStatusReport>, AppError> {
    let report = state.outbound.status(&auth).await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    entity_type: String,
    entity_id: Uuid,
    service: String,
}

async fn trigger_sync(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<TriggerRequest>,
) -> Result<Json<JsonValue>, AppError> {
    let kind = EntityKind::from_str(&body.entity_type)
        .map_err(|_| AppError::bad_request(format!("Unknown entity type: {}", body.entity_type)))?;

    let item = state
        .outbound
        .trigger_sync(kind, body.entity_id, &body.service, &auth)
        .await?;

    Ok(Json(json!({
        "success": true,
        "queue_id": item.id,
        "status": item.status,
        "priority": item.priority,
    })))
}

#[derive(Debug, Deserialize)]
struct LogQueryParams {
    entity_type: Option<String>,
    target_service: Option<String>,
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn query_sync_log(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<LogQueryParams>,
) -> Result<Json<Vec<SyncLogEntry>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(SyncLogStatus::from_str)
        .transpose()
        .map_err(|_| AppError::bad_request("Unknown log status filter"))?;

    let filter = SyncLogFilter {
        entity_type: params.entity_type,
        target_service: params.target_service,
        status,
    };
    let pagination = PaginationParams::new(params.limit.unwrap_or(50), params.offset.unwrap_or(0));

    let entries = state.outbound.query_log(&filter, pagination, &auth).await?;
    Ok(Json(entries))
}
