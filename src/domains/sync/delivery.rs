use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domains::sync::types::SyncQueueItem;
use crate::errors::{ServiceError, ServiceResult};

/// Integration-specific delivery of one queue item to a third-party service.
///
/// Implementations perform the actual network call; the worker owns retry
/// accounting, timeouts and audit logging.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    fn service_name(&self) -> &str;

    /// Deliver the item, returning a response snapshot for the audit log
    async fn deliver(&self, item: &SyncQueueItem) -> ServiceResult<JsonValue>;
}

/// Delivery adapters resolved by target-service name
#[derive(Default)]
pub struct DeliveryRegistry {
    adapters: HashMap<String, Arc<dyn DeliveryAdapter>>,
}

impl DeliveryRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn DeliveryAdapter>) {
        self.adapters
            .insert(adapter.service_name().to_string(), adapter);
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn DeliveryAdapter>> {
        self.adapters.get(service).cloned()
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Delivery adapter that posts queue items as JSON to an HTTP endpoint
pub struct HttpDeliveryAdapter {
    service: String,
    client: Client,
    endpoint: String,
}

impl HttpDeliveryAdapter {
    pub fn new(service: &str, endpoint: &str, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            service: service.to_string(),
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl DeliveryAdapter for HttpDeliveryAdapter {
    fn service_name(&self) -> &str {
        &self.service
    }

    async fn deliver(&self, item: &SyncQueueItem) -> ServiceResult<JsonValue> {
        log::debug!(
            "Delivering {} {} {} to {}",
            item.action.as_str(),
            item.entity_type,
            item.entity_id,
            self.service
        );

        let body = json!({
            "entity_type": item.entity_type,
            "entity_id": item.entity_id,
            "action": item.action,
            "payload": item.payload,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalService(format!("Failed to deliver: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let snapshot = response
                .json::<JsonValue>()
                .await
                .unwrap_or(JsonValue::Null);
            Ok(snapshot)
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to get error details".to_string());
            Err(ServiceError::ExternalService(format!(
                "Server returned error {}: {}",
                status, error_text
            )))
        }
    }
}
