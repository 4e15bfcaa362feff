use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::core::EntityKind;
use crate::domains::sync::worker::SyncWorkerConfig;
use crate::errors::{ServiceError, ServiceResult};

/// Process configuration, read once from the environment at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub worker: SyncWorkerConfig,
    pub queue_max_attempts: i64,
    pub log_retention_days: i64,
    pub retention_check_interval: Duration,
    /// (service name, endpoint URL) pairs for HTTP delivery adapters
    pub delivery_targets: Vec<(String, String)>,
    /// Entity kinds whose mutations fan out to external services
    pub outbound_routes: HashMap<EntityKind, Vec<String>>,
}

impl AppConfig {
    pub fn from_env() -> ServiceResult<Self> {
        let worker = SyncWorkerConfig {
            poll_interval: Duration::from_secs(env_parse("FIELDOPS_WORKER_POLL_SECS", 30)?),
            batch_size: env_parse("FIELDOPS_WORKER_BATCH_SIZE", 25)?,
            delivery_timeout: Duration::from_secs(env_parse("FIELDOPS_DELIVERY_TIMEOUT_SECS", 30)?),
            max_concurrent_deliveries: env_parse("FIELDOPS_MAX_CONCURRENT_DELIVERIES", 3)?,
            retry_base_delay: Duration::from_secs(env_parse("FIELDOPS_RETRY_BASE_DELAY_SECS", 60)?),
            retry_jitter: Duration::from_secs(env_parse("FIELDOPS_RETRY_JITTER_SECS", 15)?),
        };

        Ok(Self {
            bind_addr: env_or("FIELDOPS_BIND_ADDR", "0.0.0.0:8080"),
            database_url: env_or("FIELDOPS_DATABASE_URL", "sqlite://fieldops.db"),
            worker,
            queue_max_attempts: env_parse("FIELDOPS_QUEUE_MAX_ATTEMPTS", 3)?,
            log_retention_days: env_parse("FIELDOPS_LOG_RETENTION_DAYS", 30)?,
            retention_check_interval: Duration::from_secs(env_parse(
                "FIELDOPS_RETENTION_CHECK_SECS",
                3600,
            )?),
            delivery_targets: parse_delivery_targets(&env_or("FIELDOPS_DELIVERY_TARGETS", ""))?,
            outbound_routes: parse_outbound_routes(&env_or("FIELDOPS_OUTBOUND_ROUTES", ""))?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> ServiceResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| {
            ServiceError::Configuration(format!("{} has an invalid value: {}", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `service=url;service=url` pairs
fn parse_delivery_targets(raw: &str) -> ServiceResult<Vec<(String, String)>> {
    let mut targets = Vec::new();
    for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (service, endpoint) = part.split_once('=').ok_or_else(|| {
            ServiceError::Configuration(format!(
                "FIELDOPS_DELIVERY_TARGETS entry must be service=url, got: {}",
                part
            ))
        })?;
        targets.push((service.trim().to_string(), endpoint.trim().to_string()));
    }
    Ok(targets)
}

/// Parse `entity_type=service,service;entity_type=service` routing rules
fn parse_outbound_routes(raw: &str) -> ServiceResult<HashMap<EntityKind, Vec<String>>> {
    let mut routes = HashMap::new();
    for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (kind_raw, services_raw) = part.split_once('=').ok_or_else(|| {
            ServiceError::Configuration(format!(
                "FIELDOPS_OUTBOUND_ROUTES entry must be entity_type=services, got: {}",
                part
            ))
        })?;
        let kind = EntityKind::from_str(kind_raw.trim()).map_err(|_| {
            ServiceError::Configuration(format!(
                "FIELDOPS_OUTBOUND_ROUTES has an unknown entity type: {}",
                kind_raw
            ))
        })?;
        let services: Vec<String> = services_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if !services.is_empty() {
            routes.insert(kind, services);
        }
    }
    Ok(routes)
}
